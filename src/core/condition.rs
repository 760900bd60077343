//! Stage condition expressions
//!
//! A stage runs only when its condition holds. Conditions are small function
//! expressions evaluated against the results of earlier stages:
//!
//! ```text
//! succeeded()                       every dependency succeeded (the default)
//! failed('Build')                   the Build stage failed
//! and(succeeded(), eq(variables.branch, 'main'))
//! ```

use crate::core::state::StageResult;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors raised while parsing a condition
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConditionError {
    #[error("unexpected end of condition")]
    UnexpectedEnd,

    #[error("unexpected '{found}' at position {position}")]
    UnexpectedToken { found: String, position: usize },

    #[error("unterminated string starting at position {0}")]
    UnterminatedString(usize),

    #[error("unknown function '{0}'")]
    UnknownFunction(String),

    #[error("function '{function}' expects {expected}")]
    Arity {
        function: String,
        expected: &'static str,
    },
}

/// Operand of a comparison
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operand {
    /// A quoted or bare literal
    Literal(String),
    /// `variables.<name>`
    Variable(String),
}

impl Operand {
    fn resolve<'a>(&'a self, variables: &'a HashMap<String, String>) -> &'a str {
        match self {
            Operand::Literal(value) => value,
            Operand::Variable(name) => variables.get(name).map(String::as_str).unwrap_or(""),
        }
    }
}

/// A parsed stage condition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Condition {
    Succeeded(Vec<String>),
    Failed(Vec<String>),
    SucceededOrFailed(Vec<String>),
    Always,
    Not(Box<Condition>),
    And(Vec<Condition>),
    Or(Vec<Condition>),
    Eq(Operand, Operand),
    Ne(Operand, Operand),
}

impl Default for Condition {
    fn default() -> Self {
        Condition::Succeeded(Vec::new())
    }
}

/// What a condition can see when it is evaluated
#[derive(Debug, Clone, Copy)]
pub struct ConditionScope<'a> {
    /// Direct dependencies of the stage being evaluated
    pub dependencies: &'a [String],

    /// Results of stages that have already finished
    pub results: &'a HashMap<String, StageResult>,

    /// Variables visible to the stage
    pub variables: &'a HashMap<String, String>,
}

impl ConditionScope<'_> {
    fn targets<'s>(&'s self, stages: &'s [String]) -> &'s [String] {
        if stages.is_empty() {
            self.dependencies
        } else {
            stages
        }
    }

    fn result_of(&self, stage: &str) -> Option<StageResult> {
        self.results.get(stage).copied()
    }
}

impl Condition {
    /// Parse a condition expression
    pub fn parse(input: &str) -> Result<Self, ConditionError> {
        let tokens = tokenize(input)?;
        let mut parser = Parser { tokens, pos: 0 };
        let condition = parser.expression()?;
        match parser.next() {
            None => Ok(condition),
            Some((token, position)) => Err(ConditionError::UnexpectedToken {
                found: token.to_string(),
                position,
            }),
        }
    }

    /// Evaluate the condition
    pub fn evaluate(&self, scope: &ConditionScope<'_>) -> bool {
        match self {
            Condition::Succeeded(stages) => scope
                .targets(stages)
                .iter()
                .all(|s| scope.result_of(s) == Some(StageResult::Succeeded)),
            Condition::Failed(stages) => scope
                .targets(stages)
                .iter()
                .any(|s| scope.result_of(s) == Some(StageResult::Failed)),
            Condition::SucceededOrFailed(stages) => scope.targets(stages).iter().all(|s| {
                matches!(
                    scope.result_of(s),
                    Some(StageResult::Succeeded) | Some(StageResult::Failed)
                )
            }),
            Condition::Always => true,
            Condition::Not(inner) => !inner.evaluate(scope),
            Condition::And(all) => all.iter().all(|c| c.evaluate(scope)),
            Condition::Or(any) => any.iter().any(|c| c.evaluate(scope)),
            Condition::Eq(a, b) => a
                .resolve(scope.variables)
                .eq_ignore_ascii_case(b.resolve(scope.variables)),
            Condition::Ne(a, b) => !a
                .resolve(scope.variables)
                .eq_ignore_ascii_case(b.resolve(scope.variables)),
        }
    }

    /// Stage ids named explicitly inside the condition
    pub fn referenced_stages(&self) -> Vec<&str> {
        let mut stages = Vec::new();
        self.collect_stages(&mut stages);
        stages
    }

    fn collect_stages<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Condition::Succeeded(s) | Condition::Failed(s) | Condition::SucceededOrFailed(s) => {
                out.extend(s.iter().map(String::as_str))
            }
            Condition::Not(inner) => inner.collect_stages(out),
            Condition::And(all) | Condition::Or(all) => {
                for c in all {
                    c.collect_stages(out);
                }
            }
            Condition::Always | Condition::Eq(..) | Condition::Ne(..) => {}
        }
    }
}

impl FromStr for Condition {
    type Err = ConditionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Condition::parse(s)
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Literal(value) => write!(f, "'{}'", value.replace('\'', "''")),
            Operand::Variable(name) => write!(f, "variables.{}", name),
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn stages(f: &mut fmt::Formatter<'_>, name: &str, ids: &[String]) -> fmt::Result {
            let args: Vec<String> = ids.iter().map(|id| format!("'{}'", id)).collect();
            write!(f, "{}({})", name, args.join(", "))
        }
        fn list(f: &mut fmt::Formatter<'_>, name: &str, items: &[Condition]) -> fmt::Result {
            let args: Vec<String> = items.iter().map(|c| c.to_string()).collect();
            write!(f, "{}({})", name, args.join(", "))
        }

        match self {
            Condition::Succeeded(ids) => stages(f, "succeeded", ids),
            Condition::Failed(ids) => stages(f, "failed", ids),
            Condition::SucceededOrFailed(ids) => stages(f, "succeededOrFailed", ids),
            Condition::Always => write!(f, "always()"),
            Condition::Not(inner) => write!(f, "not({})", inner),
            Condition::And(all) => list(f, "and", all),
            Condition::Or(any) => list(f, "or", any),
            Condition::Eq(a, b) => write!(f, "eq({}, {})", a, b),
            Condition::Ne(a, b) => write!(f, "ne({}, {})", a, b),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Ident(String),
    Str(String),
    LParen,
    RParen,
    Comma,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Ident(s) => write!(f, "{}", s),
            Token::Str(s) => write!(f, "'{}'", s),
            Token::LParen => write!(f, "("),
            Token::RParen => write!(f, ")"),
            Token::Comma => write!(f, ","),
        }
    }
}

fn tokenize(input: &str) -> Result<Vec<(Token, usize)>, ConditionError> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push((Token::LParen, i));
                i += 1;
            }
            ')' => {
                tokens.push((Token::RParen, i));
                i += 1;
            }
            ',' => {
                tokens.push((Token::Comma, i));
                i += 1;
            }
            '\'' => {
                let start = i;
                let mut value = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(ConditionError::UnterminatedString(start)),
                        // '' is an escaped quote
                        Some('\'') if chars.get(i + 1) == Some(&'\'') => {
                            value.push('\'');
                            i += 2;
                        }
                        Some('\'') => {
                            i += 1;
                            break;
                        }
                        Some(ch) => {
                            value.push(*ch);
                            i += 1;
                        }
                    }
                }
                tokens.push((Token::Str(value), start));
            }
            c if c.is_alphanumeric() || c == '_' || c == '.' || c == '-' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || matches!(chars[i], '_' | '.' | '-'))
                {
                    i += 1;
                }
                let ident: String = chars[start..i].iter().collect();
                tokens.push((Token::Ident(ident), start));
            }
            other => {
                return Err(ConditionError::UnexpectedToken {
                    found: other.to_string(),
                    position: i,
                })
            }
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<(Token, usize)>,
    pos: usize,
}

impl Parser {
    fn next(&mut self) -> Option<(Token, usize)> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn expect(&mut self, expected: Token) -> Result<(), ConditionError> {
        match self.next() {
            Some((token, _)) if token == expected => Ok(()),
            Some((token, position)) => Err(ConditionError::UnexpectedToken {
                found: token.to_string(),
                position,
            }),
            None => Err(ConditionError::UnexpectedEnd),
        }
    }

    /// Parse `name(arg, ...)` where each argument is itself an expression
    fn expression(&mut self) -> Result<Condition, ConditionError> {
        let name = match self.next() {
            Some((Token::Ident(name), _)) => name,
            Some((token, position)) => {
                return Err(ConditionError::UnexpectedToken {
                    found: token.to_string(),
                    position,
                })
            }
            None => return Err(ConditionError::UnexpectedEnd),
        };
        self.expect(Token::LParen)?;
        let function = name.to_ascii_lowercase();

        let condition = match function.as_str() {
            "succeeded" => Condition::Succeeded(self.stage_args()?),
            "failed" => Condition::Failed(self.stage_args()?),
            "succeededorfailed" => Condition::SucceededOrFailed(self.stage_args()?),
            "always" => {
                self.expect(Token::RParen)
                    .map_err(|_| arity(&name, "no arguments"))?;
                Condition::Always
            }
            "not" => {
                let mut args = self.condition_args()?;
                if args.len() != 1 {
                    return Err(arity(&name, "exactly one argument"));
                }
                Condition::Not(Box::new(args.remove(0)))
            }
            "and" | "or" => {
                let args = self.condition_args()?;
                if args.len() < 2 {
                    return Err(arity(&name, "at least two arguments"));
                }
                if function == "and" {
                    Condition::And(args)
                } else {
                    Condition::Or(args)
                }
            }
            "eq" | "ne" => {
                let mut args = self.operand_args()?;
                if args.len() != 2 {
                    return Err(arity(&name, "exactly two arguments"));
                }
                let b = args.remove(1);
                let a = args.remove(0);
                if function == "eq" {
                    Condition::Eq(a, b)
                } else {
                    Condition::Ne(a, b)
                }
            }
            _ => return Err(ConditionError::UnknownFunction(name)),
        };

        Ok(condition)
    }

    /// Comma-separated list terminated by `)`; the opening paren is already consumed
    fn list<T>(
        &mut self,
        mut item: impl FnMut(&mut Self) -> Result<T, ConditionError>,
    ) -> Result<Vec<T>, ConditionError> {
        let mut items = Vec::new();
        if self.peek() == Some(&Token::RParen) {
            self.next();
            return Ok(items);
        }
        loop {
            items.push(item(self)?);
            match self.next() {
                Some((Token::Comma, _)) => continue,
                Some((Token::RParen, _)) => return Ok(items),
                Some((token, position)) => {
                    return Err(ConditionError::UnexpectedToken {
                        found: token.to_string(),
                        position,
                    })
                }
                None => return Err(ConditionError::UnexpectedEnd),
            }
        }
    }

    fn stage_args(&mut self) -> Result<Vec<String>, ConditionError> {
        self.list(|p| match p.next() {
            Some((Token::Ident(s), _)) | Some((Token::Str(s), _)) => Ok(s),
            Some((token, position)) => Err(ConditionError::UnexpectedToken {
                found: token.to_string(),
                position,
            }),
            None => Err(ConditionError::UnexpectedEnd),
        })
    }

    fn condition_args(&mut self) -> Result<Vec<Condition>, ConditionError> {
        self.list(|p| p.expression())
    }

    fn operand_args(&mut self) -> Result<Vec<Operand>, ConditionError> {
        self.list(|p| match p.next() {
            Some((Token::Str(s), _)) => Ok(Operand::Literal(s)),
            Some((Token::Ident(s), _)) => Ok(match s.strip_prefix("variables.") {
                Some(name) => Operand::Variable(name.to_string()),
                None => Operand::Literal(s),
            }),
            Some((token, position)) => Err(ConditionError::UnexpectedToken {
                found: token.to_string(),
                position,
            }),
            None => Err(ConditionError::UnexpectedEnd),
        })
    }
}

fn arity(function: &str, expected: &'static str) -> ConditionError {
    ConditionError::Arity {
        function: function.to_string(),
        expected,
    }
}
