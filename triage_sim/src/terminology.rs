//! In-memory terminology: a concept hierarchy and an evaluator for the rule
//! expression subset the triage engine emits.
//!
//! Supported grammar:
//!
//! ```text
//! expr     := and_expr ( OR and_expr )*
//! and_expr := unary ( ( AND | MINUS ) unary )*
//! unary    := '<<' focus | '<' focus | focus
//! focus    := code [ '|' display '|' ] | '*' | '(' expr ')'
//! ```
//!
//! `<< X` is X and all its descendants, `< X` only the descendants, a bare
//! code is itself. A bare code does not have to be known to the hierarchy.

use std::collections::{BTreeSet, HashMap, VecDeque};
use thiserror::Error;
use triage_env::Code;

/// Rule parse failures.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ExpressionError {
    #[error("unexpected end of expression")]
    UnexpectedEnd,

    #[error("unexpected token '{0}'")]
    UnexpectedToken(String),

    #[error("invalid code '{0}'")]
    InvalidCode(String),

    #[error("unterminated display term")]
    UnterminatedTerm,
}

// =============================================================================
// HIERARCHY
// =============================================================================

/// A polyhierarchy of concepts (child -> parents).
#[derive(Debug, Clone, Default)]
pub struct CodeHierarchy {
    display: HashMap<Code, String>,
    children: HashMap<Code, Vec<Code>>,
    parents: HashMap<Code, Vec<Code>>,
}

impl CodeHierarchy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a concept under the given parents. Parents need not exist yet.
    pub fn insert(&mut self, code: Code, display: impl Into<String>, parents: &[Code]) {
        self.display.insert(code.clone(), display.into());
        for parent in parents {
            self.children
                .entry(parent.clone())
                .or_default()
                .push(code.clone());
            self.parents
                .entry(code.clone())
                .or_default()
                .push(parent.clone());
        }
    }

    pub fn contains(&self, code: &Code) -> bool {
        self.display.contains_key(code)
    }

    pub fn display(&self, code: &Code) -> Option<&str> {
        self.display.get(code).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.display.len()
    }

    pub fn is_empty(&self) -> bool {
        self.display.is_empty()
    }

    /// Every known concept.
    pub fn codes(&self) -> BTreeSet<Code> {
        self.display.keys().cloned().collect()
    }

    /// Strict descendants, breadth first over the child links.
    pub fn descendants(&self, code: &Code) -> BTreeSet<Code> {
        let mut found = BTreeSet::new();
        let mut frontier: VecDeque<&Code> = VecDeque::from([code]);
        while let Some(next) = frontier.pop_front() {
            for child in self.children.get(next).into_iter().flatten() {
                if found.insert(child.clone()) {
                    frontier.push_back(child);
                }
            }
        }
        found
    }

    /// Whether `code` is `ancestor` or one of its descendants.
    pub fn is_a(&self, code: &Code, ancestor: &Code) -> bool {
        code == ancestor || self.descendants(ancestor).contains(code)
    }

    /// A SNOMED CT fragment covering the default clinic.
    pub fn clinical_findings() -> Self {
        const CONCEPTS: &[(&str, &str, &[&str])] = &[
            ("404684003", "Clinical finding", &[]),
            ("64572001", "Disease", &["404684003"]),
            ("49601007", "Disorder of cardiovascular system", &["64572001"]),
            ("414545008", "Ischemic heart disease", &["49601007"]),
            ("22298006", "Myocardial infarction", &["414545008"]),
            ("698247007", "Cardiac arrhythmia", &["49601007"]),
            ("49436004", "Atrial fibrillation", &["698247007"]),
            ("38341003", "Hypertensive disorder", &["49601007"]),
            ("50043002", "Disorder of respiratory system", &["64572001"]),
            ("195967001", "Asthma", &["50043002"]),
            ("233604007", "Pneumonia", &["50043002"]),
            ("13645005", "Chronic obstructive lung disease", &["50043002"]),
            ("928000", "Disorder of musculoskeletal system", &["64572001"]),
            ("125605004", "Fracture of bone", &["928000"]),
            ("71620000", "Fracture of femur", &["125605004"]),
            ("65966004", "Fracture of forearm", &["125605004"]),
            ("95320005", "Disorder of skin", &["64572001"]),
            ("43116000", "Eczema", &["95320005"]),
            ("9014002", "Psoriasis", &["95320005"]),
            ("362969004", "Disorder of endocrine system", &["64572001"]),
            ("73211009", "Diabetes mellitus", &["362969004"]),
            ("44054006", "Diabetes mellitus type 2", &["73211009"]),
            ("68566005", "Urinary tract infectious disease", &["64572001"]),
            ("25064002", "Headache", &["404684003"]),
        ];

        let mut hierarchy = Self::new();
        for (code, display, parents) in CONCEPTS {
            let parents: Vec<Code> = parents.iter().filter_map(|p| Code::new(*p).ok()).collect();
            if let Ok(code) = Code::new(*code) {
                hierarchy.insert(code, *display, &parents);
            }
        }
        hierarchy
    }
}

// =============================================================================
// EXPRESSIONS
// =============================================================================

/// Parsed rule expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    Any,
    Concept(Code),
    DescendantOrSelf(Box<Expression>),
    Descendant(Box<Expression>),
    And(Box<Expression>, Box<Expression>),
    Or(Box<Expression>, Box<Expression>),
    Minus(Box<Expression>, Box<Expression>),
}

impl Expression {
    pub fn parse(input: &str) -> Result<Self, ExpressionError> {
        let tokens = tokenize(input)?;
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.or_expr()?;
        match parser.peek() {
            None => Ok(expr),
            Some(token) => Err(ExpressionError::UnexpectedToken(token.to_string())),
        }
    }

    /// The set of concepts this expression denotes.
    pub fn evaluate(&self, hierarchy: &CodeHierarchy) -> BTreeSet<Code> {
        match self {
            Self::Any => hierarchy.codes(),
            Self::Concept(code) => BTreeSet::from([code.clone()]),
            Self::DescendantOrSelf(inner) => {
                let focus = inner.evaluate(hierarchy);
                let mut out = focus.clone();
                for code in &focus {
                    out.extend(hierarchy.descendants(code));
                }
                out
            }
            Self::Descendant(inner) => inner
                .evaluate(hierarchy)
                .iter()
                .flat_map(|code| hierarchy.descendants(code))
                .collect(),
            Self::And(a, b) => {
                let right = b.evaluate(hierarchy);
                a.evaluate(hierarchy)
                    .into_iter()
                    .filter(|c| right.contains(c))
                    .collect()
            }
            Self::Or(a, b) => {
                let mut out = a.evaluate(hierarchy);
                out.extend(b.evaluate(hierarchy));
                out
            }
            Self::Minus(a, b) => {
                let right = b.evaluate(hierarchy);
                a.evaluate(hierarchy)
                    .into_iter()
                    .filter(|c| !right.contains(c))
                    .collect()
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    DescendantOrSelf,
    Descendant,
    Open,
    Close,
    Star,
    And,
    Or,
    Minus,
    Term,
    Word(String),
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Token::DescendantOrSelf => f.write_str("<<"),
            Token::Descendant => f.write_str("<"),
            Token::Open => f.write_str("("),
            Token::Close => f.write_str(")"),
            Token::Star => f.write_str("*"),
            Token::And => f.write_str("AND"),
            Token::Or => f.write_str("OR"),
            Token::Minus => f.write_str("MINUS"),
            Token::Term => f.write_str("|term|"),
            Token::Word(w) => f.write_str(w),
        }
    }
}

fn tokenize(input: &str) -> Result<Vec<Token>, ExpressionError> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '<' => {
                chars.next();
                if chars.peek() == Some(&'<') {
                    chars.next();
                    tokens.push(Token::DescendantOrSelf);
                } else {
                    tokens.push(Token::Descendant);
                }
            }
            '(' => {
                chars.next();
                tokens.push(Token::Open);
            }
            ')' => {
                chars.next();
                tokens.push(Token::Close);
            }
            '*' => {
                chars.next();
                tokens.push(Token::Star);
            }
            '|' => {
                chars.next();
                loop {
                    match chars.next() {
                        Some('|') => break,
                        Some(_) => {}
                        None => return Err(ExpressionError::UnterminatedTerm),
                    }
                }
                tokens.push(Token::Term);
            }
            _ => {
                let mut word = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_whitespace() || matches!(c, '<' | '(' | ')' | '|' | '*') {
                        break;
                    }
                    word.push(c);
                    chars.next();
                }
                tokens.push(match word.to_ascii_uppercase().as_str() {
                    "AND" => Token::And,
                    "OR" => Token::Or,
                    "MINUS" => Token::Minus,
                    _ => Token::Word(word),
                });
            }
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Result<Token, ExpressionError> {
        let token = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or(ExpressionError::UnexpectedEnd)?;
        self.pos += 1;
        Ok(token)
    }

    fn or_expr(&mut self) -> Result<Expression, ExpressionError> {
        let mut left = self.and_expr()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let right = self.and_expr()?;
            left = Expression::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> Result<Expression, ExpressionError> {
        let mut left = self.unary()?;
        loop {
            match self.peek() {
                Some(Token::And) => {
                    self.pos += 1;
                    let right = self.unary()?;
                    left = Expression::And(Box::new(left), Box::new(right));
                }
                Some(Token::Minus) => {
                    self.pos += 1;
                    let right = self.unary()?;
                    left = Expression::Minus(Box::new(left), Box::new(right));
                }
                _ => return Ok(left),
            }
        }
    }

    fn unary(&mut self) -> Result<Expression, ExpressionError> {
        match self.peek() {
            Some(Token::DescendantOrSelf) => {
                self.pos += 1;
                Ok(Expression::DescendantOrSelf(Box::new(self.focus()?)))
            }
            Some(Token::Descendant) => {
                self.pos += 1;
                Ok(Expression::Descendant(Box::new(self.focus()?)))
            }
            _ => self.focus(),
        }
    }

    fn focus(&mut self) -> Result<Expression, ExpressionError> {
        match self.next()? {
            Token::Star => Ok(Expression::Any),
            Token::Open => {
                let inner = self.or_expr()?;
                match self.next()? {
                    Token::Close => Ok(inner),
                    other => Err(ExpressionError::UnexpectedToken(other.to_string())),
                }
            }
            Token::Word(word) => {
                let code = Code::new(word.as_str())
                    .map_err(|_| ExpressionError::InvalidCode(word.clone()))?;
                if self.peek() == Some(&Token::Term) {
                    self.pos += 1;
                }
                Ok(Expression::Concept(code))
            }
            other => Err(ExpressionError::UnexpectedToken(other.to_string())),
        }
    }
}
