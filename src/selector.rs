//! Structural selectors over element tags, classes and attributes.
//!
//! Only compound selectors and comma-separated lists are understood. That is
//! the subset feed detection needs; anything else (descendant, child or
//! sibling combinators) is rejected with a typed error so callers can skip the
//! pattern instead of matching the wrong elements.

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SelectorError {
    #[error("empty selector")]
    Empty,
    #[error("unexpected character {ch:?} at offset {offset}")]
    Unexpected { ch: char, offset: usize },
    #[error("unterminated attribute block starting at offset {0}")]
    UnterminatedAttribute(usize),
    #[error("unterminated quoted value starting at offset {0}")]
    UnterminatedQuote(usize),
    #[error("combinators are not supported (offset {0})")]
    UnsupportedCombinator(usize),
}

/// Read access to the element a selector is tested against.
pub trait Element {
    fn tag(&self) -> &str;
    fn attr(&self, name: &str) -> Option<&str>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttrOp {
    Exists,
    Equals(String),
    Contains(String),
    Prefix(String),
    Suffix(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttrMatch {
    pub name: String,
    pub op: AttrOp,
}

impl AttrMatch {
    fn matches(&self, value: Option<&str>) -> bool {
        let Some(value) = value else {
            return false;
        };
        match &self.op {
            AttrOp::Exists => true,
            AttrOp::Equals(expected) => value == expected,
            // An empty needle never matches for the substring operators.
            AttrOp::Contains(needle) => !needle.is_empty() && value.contains(needle.as_str()),
            AttrOp::Prefix(needle) => !needle.is_empty() && value.starts_with(needle.as_str()),
            AttrOp::Suffix(needle) => !needle.is_empty() && value.ends_with(needle.as_str()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Compound {
    pub tag: Option<String>,
    pub classes: Vec<String>,
    pub attrs: Vec<AttrMatch>,
}

impl Compound {
    fn matches<E: Element + ?Sized>(&self, el: &E) -> bool {
        if let Some(tag) = &self.tag {
            if !el.tag().eq_ignore_ascii_case(tag) {
                return false;
            }
        }
        if !self.classes.is_empty() {
            let class_attr = el.attr("class").unwrap_or_default();
            if !self
                .classes
                .iter()
                .all(|wanted| class_attr.split_ascii_whitespace().any(|c| c == wanted))
            {
                return false;
            }
        }
        self.attrs
            .iter()
            .all(|attr| attr.matches(el.attr(&attr.name)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selector {
    source: String,
    alternatives: Vec<Compound>,
}

impl Selector {
    pub fn parse(input: &str) -> Result<Self, SelectorError> {
        let alternatives = Parser { src: input, pos: 0 }.selector_list()?;
        Ok(Self {
            source: input.to_string(),
            alternatives,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn alternatives(&self) -> &[Compound] {
        &self.alternatives
    }

    pub fn matches<E: Element + ?Sized>(&self, el: &E) -> bool {
        self.alternatives.iter().any(|c| c.matches(el))
    }
}

impl std::fmt::Display for Selector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.source)
    }
}

impl std::str::FromStr for Selector {
    type Err = SelectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Selector::parse(s)
    }
}

struct Parser<'a> {
    src: &'a str,
    pos: usize,
}

fn is_ident_char(ch: char) -> bool {
    ch.is_alphanumeric() || ch == '-' || ch == '_' || !ch.is_ascii()
}

impl Parser<'_> {
    fn peek(&self) -> Option<char> {
        self.src[self.pos..].chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let ch = self.peek()?;
        self.pos += ch.len_utf8();
        Some(ch)
    }

    fn skip_ws(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.bump();
        }
    }

    fn unexpected(&self) -> SelectorError {
        match self.peek() {
            Some(ch) => SelectorError::Unexpected {
                ch,
                offset: self.pos,
            },
            None => SelectorError::Empty,
        }
    }

    fn ident(&mut self) -> &str {
        let start = self.pos;
        while self.peek().is_some_and(is_ident_char) {
            self.bump();
        }
        &self.src[start..self.pos]
    }

    fn selector_list(&mut self) -> Result<Vec<Compound>, SelectorError> {
        let mut alternatives = Vec::new();
        loop {
            self.skip_ws();
            alternatives.push(self.compound()?);
            let before_ws = self.pos;
            self.skip_ws();
            match self.peek() {
                None => break,
                Some(',') => {
                    self.bump();
                }
                Some('>' | '+' | '~') => {
                    return Err(SelectorError::UnsupportedCombinator(self.pos))
                }
                Some(ch) if self.pos > before_ws && (is_ident_char(ch) || "*.[".contains(ch)) => {
                    return Err(SelectorError::UnsupportedCombinator(before_ws))
                }
                Some(_) => return Err(self.unexpected()),
            }
        }
        Ok(alternatives)
    }

    fn compound(&mut self) -> Result<Compound, SelectorError> {
        let start = self.pos;
        let mut compound = Compound::default();
        match self.peek() {
            Some('*') => {
                self.bump();
            }
            Some(ch) if is_ident_char(ch) => {
                compound.tag = Some(self.ident().to_ascii_lowercase());
            }
            _ => {}
        }
        loop {
            match self.peek() {
                Some('.') => {
                    self.bump();
                    let class = self.ident();
                    if class.is_empty() {
                        return Err(self.unexpected());
                    }
                    compound.classes.push(class.to_string());
                }
                Some('[') => compound.attrs.push(self.attribute()?),
                _ => break,
            }
        }
        if self.pos == start {
            return Err(self.unexpected());
        }
        Ok(compound)
    }

    fn attribute(&mut self) -> Result<AttrMatch, SelectorError> {
        let open = self.pos;
        self.bump();
        self.skip_ws();
        let name = self.ident().to_ascii_lowercase();
        if name.is_empty() {
            return Err(match self.peek() {
                None => SelectorError::UnterminatedAttribute(open),
                Some(_) => self.unexpected(),
            });
        }
        self.skip_ws();
        let op = match self.peek() {
            None => return Err(SelectorError::UnterminatedAttribute(open)),
            Some(']') => AttrOp::Exists,
            Some('=') => {
                self.bump();
                AttrOp::Equals(self.value()?)
            }
            Some(op @ ('*' | '^' | '$')) => {
                self.bump();
                if self.peek() != Some('=') {
                    return Err(self.unexpected());
                }
                self.bump();
                let value = self.value()?;
                match op {
                    '*' => AttrOp::Contains(value),
                    '^' => AttrOp::Prefix(value),
                    _ => AttrOp::Suffix(value),
                }
            }
            Some(_) => return Err(self.unexpected()),
        };
        self.skip_ws();
        match self.bump() {
            Some(']') => Ok(AttrMatch { name, op }),
            None => Err(SelectorError::UnterminatedAttribute(open)),
            Some(ch) => Err(SelectorError::Unexpected {
                ch,
                offset: self.pos - ch.len_utf8(),
            }),
        }
    }

    fn value(&mut self) -> Result<String, SelectorError> {
        self.skip_ws();
        match self.peek() {
            Some(quote @ ('"' | '\'')) => {
                let start = self.pos;
                self.bump();
                let body_start = self.pos;
                loop {
                    match self.bump() {
                        Some(ch) if ch == quote => {
                            return Ok(self.src[body_start..self.pos - 1].to_string())
                        }
                        Some(_) => {}
                        None => return Err(SelectorError::UnterminatedQuote(start)),
                    }
                }
            }
            _ => {
                let value = self.ident();
                if value.is_empty() {
                    return Err(self.unexpected());
                }
                Ok(value.to_string())
            }
        }
    }
}
