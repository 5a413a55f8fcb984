//! C-subset lexer. Comments (`//...`, `/*...*/`) are discarded here; the
//! preprocessor-line strip happens a pass earlier in `cfront::compile`.

use crate::error::SyntaxIssue;

/// `(line, col)` derived from the byte offset of the significant character
/// in the original source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Position {
    pub line: usize,
    pub col: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenKind {
    Identifier(String),
    Integer(i64),
    /// The raw quoted form, including quotes, with escapes un-interpreted —
    /// the string pool (assembler side) needs the exact source text.
    StringLit(String),
    Punct(&'static str),
    Eof,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub pos: Position,
}

const PUNCTUATION: &[&str] = &[
    "==", "!=", "<=", ">=", "+", "-", "*", "/", "=", "<", ">", "(", ")", "{", "}", ";", ",",
];

struct Lexer {
    chars: Vec<char>,
    offset: usize,
    line: usize,
    col: usize,
    tokens: Vec<Token>,
    issues: Vec<SyntaxIssue>,
}

impl Lexer {
    fn new(src: &str) -> Self {
        Self {
            chars: src.chars().collect(),
            offset: 0,
            line: 1,
            col: 1,
            tokens: Vec::new(),
            issues: Vec::new(),
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.offset).copied()
    }

    fn peek_at(&self, ahead: usize) -> Option<char> {
        self.chars.get(self.offset + ahead).copied()
    }

    fn pos(&self) -> Position {
        Position {
            line: self.line,
            col: self.col,
        }
    }

    fn advance(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.offset += 1;
        if c == '\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        Some(c)
    }

    fn skip_whitespace_and_comments(&mut self) {
        loop {
            match self.peek() {
                Some(c) if c.is_whitespace() => {
                    self.advance();
                }
                Some('/') if self.peek_at(1) == Some('/') => {
                    while let Some(c) = self.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.advance();
                    }
                }
                Some('/') if self.peek_at(1) == Some('*') => {
                    self.advance();
                    self.advance();
                    loop {
                        match self.peek() {
                            None => break,
                            Some('*') if self.peek_at(1) == Some('/') => {
                                self.advance();
                                self.advance();
                                break;
                            }
                            Some(_) => {
                                self.advance();
                            }
                        }
                    }
                }
                _ => break,
            }
        }
    }

    fn lex_number(&mut self) -> Token {
        let pos = self.pos();
        let mut text = String::new();
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() {
                text.push(c);
                self.advance();
            } else {
                break;
            }
        }
        let value: i64 = text.parse().unwrap_or(0);
        Token {
            kind: TokenKind::Integer(value),
            pos,
        }
    }

    fn lex_identifier(&mut self) -> Token {
        let pos = self.pos();
        let mut text = String::new();
        while let Some(c) = self.peek() {
            if c.is_alphanumeric() || c == '_' {
                text.push(c);
                self.advance();
            } else {
                break;
            }
        }
        Token {
            kind: TokenKind::Identifier(text),
            pos,
        }
    }

    fn lex_string(&mut self) -> Option<Token> {
        let pos = self.pos();
        let start = self.offset;
        self.advance(); // opening quote
        loop {
            match self.peek() {
                None => {
                    self.issues
                        .push(SyntaxIssue::new(pos.line, pos.col, "unterminated string literal"));
                    return None;
                }
                Some('\\') => {
                    self.advance();
                    self.advance();
                }
                Some('"') => {
                    self.advance();
                    break;
                }
                Some(_) => {
                    self.advance();
                }
            }
        }
        let raw: String = self.chars[start..self.offset].iter().collect();
        Some(Token {
            kind: TokenKind::StringLit(raw),
            pos,
        })
    }

    fn lex_punct(&mut self) -> Option<Token> {
        let pos = self.pos();
        for lexeme in PUNCTUATION {
            let matches = lexeme
                .chars()
                .enumerate()
                .all(|(i, c)| self.peek_at(i) == Some(c));
            if matches {
                for _ in 0..lexeme.chars().count() {
                    self.advance();
                }
                return Some(Token {
                    kind: TokenKind::Punct(lexeme),
                    pos,
                });
            }
        }
        None
    }

    fn run(mut self) -> Result<Vec<Token>, Vec<SyntaxIssue>> {
        loop {
            self.skip_whitespace_and_comments();
            let Some(c) = self.peek() else {
                self.tokens.push(Token {
                    kind: TokenKind::Eof,
                    pos: self.pos(),
                });
                break;
            };
            if c.is_ascii_digit() {
                let tok = self.lex_number();
                self.tokens.push(tok);
            } else if c.is_alphabetic() || c == '_' {
                let tok = self.lex_identifier();
                self.tokens.push(tok);
            } else if c == '"' {
                if let Some(tok) = self.lex_string() {
                    self.tokens.push(tok);
                }
            } else if let Some(tok) = self.lex_punct() {
                self.tokens.push(tok);
            } else {
                let pos = self.pos();
                self.issues
                    .push(SyntaxIssue::new(pos.line, pos.col, format!("unexpected character '{c}'")));
                self.advance();
            }
        }
        if self.issues.is_empty() {
            Ok(self.tokens)
        } else {
            Err(self.issues)
        }
    }
}

pub fn lex(src: &str) -> Result<Vec<Token>, Vec<SyntaxIssue>> {
    Lexer::new(src).run()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        lex(src).unwrap().into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn lexes_declaration() {
        assert_eq!(
            kinds("int a = 10;"),
            vec![
                TokenKind::Identifier("int".into()),
                TokenKind::Identifier("a".into()),
                TokenKind::Punct("="),
                TokenKind::Integer(10),
                TokenKind::Punct(";"),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn discards_comments() {
        assert_eq!(
            kinds("int a; // trailing\n/* block */ int b;"),
            vec![
                TokenKind::Identifier("int".into()),
                TokenKind::Identifier("a".into()),
                TokenKind::Punct(";"),
                TokenKind::Identifier("int".into()),
                TokenKind::Identifier("b".into()),
                TokenKind::Punct(";"),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn string_literal_keeps_raw_quoted_form() {
        let tokens = lex(r#""%d\n""#).unwrap();
        assert_eq!(tokens[0].kind, TokenKind::StringLit(r#""%d\n""#.to_string()));
    }

    #[test]
    fn tracks_line_and_col() {
        let tokens = lex("int\na;").unwrap();
        assert_eq!(tokens[1].pos, Position { line: 2, col: 1 });
    }

    #[test]
    fn reports_unexpected_character() {
        assert!(lex("int a = 1 $;").is_err());
    }
}
