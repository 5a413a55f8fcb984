//! AT&T/GAS lexer. Recognizes decimal integers, `%`-prefixed
//! registers, `name:` labels, dot-directives, mnemonics, the operand
//! punctuation `$ ( ) , %`, `#...`-to-end-of-line comments, and string
//! literals with the standard escapes.

use crate::error::SyntaxIssue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Position {
    pub line: usize,
    pub col: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenKind {
    Integer(i64),
    Register(String),
    /// An identifier immediately followed by `:` — a label definition.
    Label(String),
    Directive(String),
    /// A bare identifier that isn't a label or directive: a mnemonic or a
    /// symbol reference.
    Ident(String),
    StringLit(Vec<u8>),
    Punct(char),
    Newline,
    Eof,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub pos: Position,
}

struct Lexer {
    chars: Vec<char>,
    offset: usize,
    line: usize,
    col: usize,
    issues: Vec<SyntaxIssue>,
}

impl Lexer {
    fn new(src: &str) -> Self {
        Self {
            chars: src.chars().collect(),
            offset: 0,
            line: 1,
            col: 1,
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

    fn skip_inline_whitespace_and_comments(&mut self) {
        loop {
            match self.peek() {
                Some(c) if c == ' ' || c == '\t' || c == '\r' => {
                    self.advance();
                }
                Some('#') => {
                    while let Some(c) = self.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.advance();
                    }
                }
                _ => break,
            }
        }
    }

    fn lex_number(&mut self) -> Token {
        let pos = self.pos();
        let negative = self.peek() == Some('-');
        if negative {
            self.advance();
        }
        let mut text = String::new();
        let hex = self.peek() == Some('0') && matches!(self.peek_at(1), Some('x') | Some('X'));
        if hex {
            text.push_str("0x");
            self.advance();
            self.advance();
            while let Some(c) = self.peek() {
                if c.is_ascii_hexdigit() {
                    text.push(c);
                    self.advance();
                } else {
                    break;
                }
            }
        } else {
            while let Some(c) = self.peek() {
                if c.is_ascii_digit() {
                    text.push(c);
                    self.advance();
                } else {
                    break;
                }
            }
        }
        let value = if hex {
            i64::from_str_radix(text.trim_start_matches("0x"), 16).unwrap_or(0)
        } else {
            text.parse().unwrap_or(0)
        };
        Token {
            kind: TokenKind::Integer(if negative { -value } else { value }),
            pos,
        }
    }

    fn lex_word(&mut self) -> String {
        let mut text = String::new();
        while let Some(c) = self.peek() {
            if c.is_alphanumeric() || c == '_' || c == '.' {
                text.push(c);
                self.advance();
            } else {
                break;
            }
        }
        text
    }

    fn lex_string(&mut self) -> Option<Token> {
        let pos = self.pos();
        self.advance(); // opening quote
        let mut bytes = Vec::new();
        loop {
            match self.peek() {
                None => {
                    self.issues
                        .push(SyntaxIssue::new(pos.line, pos.col, "unterminated string literal"));
                    return None;
                }
                Some('"') => {
                    self.advance();
                    break;
                }
                Some('\\') => {
                    self.advance();
                    match self.advance() {
                        Some('n') => bytes.push(b'\n'),
                        Some('t') => bytes.push(b'\t'),
                        Some('0') => bytes.push(0),
                        Some('\\') => bytes.push(b'\\'),
                        Some('"') => bytes.push(b'"'),
                        Some(other) => {
                            let mut buf = [0u8; 4];
                            bytes.extend_from_slice(other.encode_utf8(&mut buf).as_bytes())
                        }
                        None => {}
                    }
                }
                Some(c) => {
                    let mut buf = [0u8; 4];
                    bytes.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
                    self.advance();
                }
            }
        }
        Some(Token {
            kind: TokenKind::StringLit(bytes),
            pos,
        })
    }

    fn run(mut self) -> Result<Vec<Token>, Vec<SyntaxIssue>> {
        let mut tokens = Vec::new();
        loop {
            self.skip_inline_whitespace_and_comments();
            let Some(c) = self.peek() else {
                tokens.push(Token {
                    kind: TokenKind::Eof,
                    pos: self.pos(),
                });
                break;
            };
            if c == '\n' {
                let pos = self.pos();
                self.advance();
                tokens.push(Token {
                    kind: TokenKind::Newline,
                    pos,
                });
            } else if c.is_ascii_digit() || (c == '-' && self.peek_at(1).is_some_and(|d| d.is_ascii_digit())) {
                tokens.push(self.lex_number());
            } else if c == '%' {
                let pos = self.pos();
                self.advance();
                let name = self.lex_word();
                tokens.push(Token {
                    kind: TokenKind::Register(name),
                    pos,
                });
            } else if c == '"' {
                if let Some(tok) = self.lex_string() {
                    tokens.push(tok);
                }
            } else if c == '.' {
                let pos = self.pos();
                let name = self.lex_word();
                if self.peek() == Some(':') {
                    self.advance();
                    tokens.push(Token {
                        kind: TokenKind::Label(name),
                        pos,
                    });
                } else {
                    tokens.push(Token {
                        kind: TokenKind::Directive(name),
                        pos,
                    });
                }
            } else if c.is_alphabetic() || c == '_' {
                let pos = self.pos();
                let name = self.lex_word();
                if self.peek() == Some(':') {
                    self.advance();
                    tokens.push(Token {
                        kind: TokenKind::Label(name),
                        pos,
                    });
                } else {
                    tokens.push(Token {
                        kind: TokenKind::Ident(name),
                        pos,
                    });
                }
            } else if "$(),".contains(c) {
                let pos = self.pos();
                self.advance();
                tokens.push(Token {
                    kind: TokenKind::Punct(c),
                    pos,
                });
            } else {
                let pos = self.pos();
                self.issues
                    .push(SyntaxIssue::new(pos.line, pos.col, format!("unexpected character '{c}'")));
                self.advance();
            }
        }
        if self.issues.is_empty() {
            Ok(tokens)
        } else {
            Err(self.issues)
        }
    }
}

pub fn lex(src: &str) -> Result<Vec<Token>, Vec<SyntaxIssue>> {
    Lexer::new(src).run()
}
