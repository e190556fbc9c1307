//! The small SQL dialect understood by the [`MemoryEngine`](super::memory::MemoryEngine).
//!
//! ```text
//! CREATE TABLE [db.]name (column Type, ...)
//! DROP TABLE [db.]name
//! INSERT INTO [db.]name
//! SELECT * FROM source [LIMIT n] [WITH TOTALS]
//!
//! source := [db.]name | numbers(n)
//! Type   := UInt64 | Int64 | Float64 | String
//! ```
//!
//! Keywords are case-insensitive. The rows of an `INSERT` arrive separately, as Data packets.
use thiserror::Error;

use crate::{
    block::ColumnType,
    error::{ErrorCode, QueryError},
};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum StatementError {
    #[error("empty statement")]
    EmptyStatement,

    #[error("statement not supported: {0}")]
    Unsupported(String),

    #[error("expected {expected}, found '{found}'")]
    Expected { expected: String, found: String },

    #[error("unexpected end of statement, expected {0}")]
    UnexpectedEnd(String),

    #[error("unexpected character '{0}'")]
    UnexpectedCharacter(char),

    #[error("unknown type '{0}'")]
    UnknownType(String),
}

impl From<StatementError> for QueryError {
    fn from(value: StatementError) -> Self {
        QueryError::new(ErrorCode::Syntax, value.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableName {
    pub database: Option<String>,
    pub name: String,
}

impl TableName {
    /// Fully qualified name, using `default_database` if none was given.
    pub fn qualify(&self, default_database: &str) -> String {
        format!(
            "{}.{}",
            self.database.as_deref().unwrap_or(default_database),
            self.name
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    Table(TableName),
    Numbers(u64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Statement {
    CreateTable {
        table: TableName,
        columns: Vec<(String, ColumnType)>,
    },
    DropTable {
        table: TableName,
    },
    Insert {
        table: TableName,
    },
    Select {
        source: Source,
        limit: Option<u64>,
        with_totals: bool,
    },
}

/// True if the query is an `INSERT`, judged by its first keyword.
pub fn is_insert(query: &str) -> bool {
    query
        .split_whitespace()
        .next()
        .is_some_and(|word| word.eq_ignore_ascii_case("insert"))
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Word(String),
    Symbol(char),
}

impl Token {
    fn text(&self) -> String {
        match self {
            Token::Word(w) => w.clone(),
            Token::Symbol(c) => c.to_string(),
        }
    }
}

fn tokenize(s: &str) -> Result<Vec<Token>, StatementError> {
    let mut tokens = Vec::new();
    let mut chars = s.chars().peekable();

    while let Some(&ch) = chars.peek() {
        match ch {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' | ')' | ',' | '*' => {
                tokens.push(Token::Symbol(ch));
                chars.next();
            }
            ';' => {
                chars.next();
            }
            c if c.is_ascii_alphanumeric() || c == '_' || c == '.' => {
                let mut word = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_alphanumeric() || c == '_' || c == '.' {
                        word.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Word(word));
            }
            c => return Err(StatementError::UnexpectedCharacter(c)),
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

    fn next(&mut self, expected: &str) -> Result<Token, StatementError> {
        let token = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or_else(|| StatementError::UnexpectedEnd(expected.to_string()))?;
        self.pos += 1;
        Ok(token)
    }

    fn keyword(&mut self, keyword: &str) -> Result<(), StatementError> {
        match self.next(keyword)? {
            Token::Word(w) if w.eq_ignore_ascii_case(keyword) => Ok(()),
            other => Err(StatementError::Expected {
                expected: keyword.to_string(),
                found: other.text(),
            }),
        }
    }

    fn peek_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), Some(Token::Word(w)) if w.eq_ignore_ascii_case(keyword))
    }

    fn symbol(&mut self, symbol: char) -> Result<(), StatementError> {
        match self.next(&symbol.to_string())? {
            Token::Symbol(c) if c == symbol => Ok(()),
            other => Err(StatementError::Expected {
                expected: symbol.to_string(),
                found: other.text(),
            }),
        }
    }

    fn word(&mut self, expected: &str) -> Result<String, StatementError> {
        match self.next(expected)? {
            Token::Word(w) => Ok(w),
            other => Err(StatementError::Expected {
                expected: expected.to_string(),
                found: other.text(),
            }),
        }
    }

    fn number(&mut self) -> Result<u64, StatementError> {
        let word = self.word("number")?;
        word.parse().map_err(|_| StatementError::Expected {
            expected: "non-negative integer".into(),
            found: word,
        })
    }

    fn table(&mut self) -> Result<TableName, StatementError> {
        let word = self.word("table name")?;
        let parts = word.split('.').collect::<Vec<&str>>();
        match parts.as_slice() {
            [name] if !name.is_empty() => Ok(TableName {
                database: None,
                name: name.to_string(),
            }),
            [db, name] if !db.is_empty() && !name.is_empty() => Ok(TableName {
                database: Some(db.to_string()),
                name: name.to_string(),
            }),
            _ => Err(StatementError::Expected {
                expected: "table name".into(),
                found: word,
            }),
        }
    }

    fn end(&self) -> Result<(), StatementError> {
        match self.peek() {
            None => Ok(()),
            Some(token) => Err(StatementError::Expected {
                expected: "end of statement".into(),
                found: token.text(),
            }),
        }
    }

    fn create(&mut self) -> Result<Statement, StatementError> {
        self.keyword("table")?;
        let table = self.table()?;
        self.symbol('(')?;

        let mut columns = Vec::new();
        loop {
            let name = self.word("column name")?;
            let type_name = self.word("column type")?;
            let column_type =
                ColumnType::parse(&type_name).ok_or(StatementError::UnknownType(type_name))?;
            columns.push((name, column_type));

            match self.next(")")? {
                Token::Symbol(',') => continue,
                Token::Symbol(')') => break,
                other => {
                    return Err(StatementError::Expected {
                        expected: "',' or ')'".into(),
                        found: other.text(),
                    });
                }
            }
        }

        Ok(Statement::CreateTable { table, columns })
    }

    fn select(&mut self) -> Result<Statement, StatementError> {
        self.symbol('*')?;
        self.keyword("from")?;

        let source = if matches!(self.peek(), Some(Token::Word(w)) if w.eq_ignore_ascii_case("numbers"))
            && matches!(self.tokens.get(self.pos + 1), Some(Token::Symbol('(')))
        {
            self.pos += 1;
            self.symbol('(')?;
            let n = self.number()?;
            self.symbol(')')?;
            Source::Numbers(n)
        } else {
            Source::Table(self.table()?)
        };

        let mut limit = None;
        let mut with_totals = false;
        if self.peek_keyword("limit") {
            self.pos += 1;
            limit = Some(self.number()?);
        }
        if self.peek_keyword("with") {
            self.pos += 1;
            self.keyword("totals")?;
            with_totals = true;
        }

        Ok(Statement::Select {
            source,
            limit,
            with_totals,
        })
    }
}

impl TryFrom<&str> for Statement {
    type Error = StatementError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let tokens = tokenize(value)?;
        let mut parser = Parser { tokens, pos: 0 };

        let first = match parser.peek() {
            None => return Err(StatementError::EmptyStatement),
            Some(Token::Word(w)) => w.to_lowercase(),
            Some(_) => return Err(StatementError::Unsupported(value.trim().to_string())),
        };
        parser.pos += 1;

        let statement = match first.as_str() {
            "create" => parser.create()?,
            "drop" => {
                parser.keyword("table")?;
                Statement::DropTable {
                    table: parser.table()?,
                }
            }
            "insert" => {
                parser.keyword("into")?;
                Statement::Insert {
                    table: parser.table()?,
                }
            }
            "select" => parser.select()?,
            _ => return Err(StatementError::Unsupported(value.trim().to_string())),
        };

        parser.end()?;
        Ok(statement)
    }
}
