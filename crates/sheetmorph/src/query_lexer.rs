//! Tokenizer for query expressions.

use regex::{Regex, RegexBuilder};

use crate::error::{ConvertError, ExprLocation};

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    /// Field name, plain or back-quoted. Also carries `and`, `or`, `in` and
    /// `function`, whose meaning depends on where they appear.
    Name(String),
    /// `$name`; `$` is `Variable("")` and `$$` is `Variable("$")`.
    Variable(String),
    Str(String),
    Number(f64),
    /// `/pattern/flags`, lexed only where an operand is expected.
    Regex { pattern: String, flags: String },
    True,
    False,
    Null,
    Dot,
    DotDot,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    LParen,
    RParen,
    Comma,
    Colon,
    Semicolon,
    Question,
    Amp,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Eq,
    Ne,
    Lt,
    Lte,
    Gt,
    Gte,
    Assign,
    Chain,
    Eof,
}

impl TokenKind {
    pub fn describe(&self) -> String {
        match self {
            TokenKind::Name(name) => format!("name '{}'", name),
            TokenKind::Variable(name) => format!("variable '${}'", name),
            TokenKind::Str(s) => format!("string \"{}\"", s),
            TokenKind::Number(n) => format!("number {}", n),
            TokenKind::Regex { pattern, flags } => format!("regex /{}/{}", pattern, flags),
            TokenKind::True => "'true'".to_string(),
            TokenKind::False => "'false'".to_string(),
            TokenKind::Null => "'null'".to_string(),
            TokenKind::Eof => "end of expression".to_string(),
            other => format!("'{}'", other.symbol()),
        }
    }

    fn symbol(&self) -> &'static str {
        match self {
            TokenKind::Dot => ".",
            TokenKind::DotDot => "..",
            TokenKind::LBracket => "[",
            TokenKind::RBracket => "]",
            TokenKind::LBrace => "{",
            TokenKind::RBrace => "}",
            TokenKind::LParen => "(",
            TokenKind::RParen => ")",
            TokenKind::Comma => ",",
            TokenKind::Colon => ":",
            TokenKind::Semicolon => ";",
            TokenKind::Question => "?",
            TokenKind::Amp => "&",
            TokenKind::Plus => "+",
            TokenKind::Minus => "-",
            TokenKind::Star => "*",
            TokenKind::Slash => "/",
            TokenKind::Percent => "%",
            TokenKind::Eq => "=",
            TokenKind::Ne => "!=",
            TokenKind::Lt => "<",
            TokenKind::Lte => "<=",
            TokenKind::Gt => ">",
            TokenKind::Gte => ">=",
            TokenKind::Assign => ":=",
            TokenKind::Chain => "~>",
            _ => "",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    /// Byte offset of the first character of the token.
    pub offset: usize,
}

pub fn tokenize(source: &str) -> Result<Vec<Token>, ConvertError> {
    Lexer::new(source).run()
}

/// Compile a regex literal. Only the `i` and `m` flags are meaningful.
pub(crate) fn compile_regex(pattern: &str, flags: &str) -> Result<Regex, regex::Error> {
    RegexBuilder::new(pattern)
        .case_insensitive(flags.contains('i'))
        .multi_line(flags.contains('m'))
        .build()
}

struct Lexer<'a> {
    source: &'a str,
    pos: usize,
    tokens: Vec<Token>,
}

impl<'a> Lexer<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            source,
            pos: 0,
            tokens: Vec::new(),
        }
    }

    fn error(&self, offset: usize, message: impl Into<String>) -> ConvertError {
        ConvertError::syntax(message).with_location(ExprLocation::from_offset(self.source, offset))
    }

    fn peek(&self) -> Option<char> {
        self.source[self.pos..].chars().next()
    }

    fn peek_at(&self, n: usize) -> Option<char> {
        self.source[self.pos..].chars().nth(n)
    }

    fn bump(&mut self) -> Option<char> {
        let ch = self.peek()?;
        self.pos += ch.len_utf8();
        Some(ch)
    }

    fn push(&mut self, kind: TokenKind, offset: usize) {
        self.tokens.push(Token { kind, offset });
    }

    /// A `/` starts a regex unless the previous token can end an operand.
    fn expects_operand(&self) -> bool {
        match self.tokens.last().map(|token| &token.kind) {
            None => true,
            Some(TokenKind::Name(name)) => matches!(name.as_str(), "and" | "or" | "in"),
            Some(
                TokenKind::Variable(_)
                | TokenKind::Str(_)
                | TokenKind::Number(_)
                | TokenKind::Regex { .. }
                | TokenKind::True
                | TokenKind::False
                | TokenKind::Null
                | TokenKind::RParen
                | TokenKind::RBracket
                | TokenKind::RBrace
                | TokenKind::Star,
            ) => false,
            Some(_) => true,
        }
    }

    fn run(mut self) -> Result<Vec<Token>, ConvertError> {
        while let Some(ch) = self.peek() {
            let start = self.pos;
            if ch.is_whitespace() {
                self.bump();
                continue;
            }
            if ch == '/' && self.peek_at(1) == Some('*') {
                self.skip_comment()?;
                continue;
            }
            if ch == '/' && self.expects_operand() {
                let kind = self.lex_regex()?;
                self.push(kind, start);
                continue;
            }
            if ch == '"' || ch == '\'' {
                let s = self.lex_string(ch)?;
                self.push(TokenKind::Str(s), start);
                continue;
            }
            if ch == '`' {
                let name = self.lex_backtick()?;
                self.push(TokenKind::Name(name), start);
                continue;
            }
            if ch.is_ascii_digit() {
                let n = self.lex_number()?;
                self.push(TokenKind::Number(n), start);
                continue;
            }
            if ch == '$' {
                self.bump();
                let name = if self.peek() == Some('$') {
                    self.bump();
                    "$".to_string()
                } else {
                    self.lex_identifier()
                };
                self.push(TokenKind::Variable(name), start);
                continue;
            }
            if is_name_start(ch) {
                let word = self.lex_identifier();
                let kind = match word.as_str() {
                    "true" => TokenKind::True,
                    "false" => TokenKind::False,
                    "null" => TokenKind::Null,
                    _ => TokenKind::Name(word),
                };
                self.push(kind, start);
                continue;
            }
            let kind = self.lex_operator(ch, start)?;
            self.push(kind, start);
        }
        let end = self.source.len();
        self.push(TokenKind::Eof, end);
        Ok(self.tokens)
    }

    fn skip_comment(&mut self) -> Result<(), ConvertError> {
        let start = self.pos;
        self.pos += 2;
        match self.source[self.pos..].find("*/") {
            Some(idx) => {
                self.pos += idx + 2;
                Ok(())
            }
            None => Err(self.error(start, "comment has no closing tag")),
        }
    }

    fn lex_regex(&mut self) -> Result<TokenKind, ConvertError> {
        let start = self.pos;
        self.bump();
        let mut pattern = String::new();
        loop {
            match self.bump() {
                None => return Err(self.error(start, "regex literal is not terminated")),
                Some('/') => break,
                Some('\\') => match self.bump() {
                    Some('/') => pattern.push('/'),
                    Some(escaped) => {
                        pattern.push('\\');
                        pattern.push(escaped);
                    }
                    None => return Err(self.error(start, "regex literal is not terminated")),
                },
                Some(ch) => pattern.push(ch),
            }
        }
        if pattern.is_empty() {
            return Err(self.error(start, "regex literal is empty"));
        }
        let mut flags = String::new();
        while let Some(flag) = self.peek().filter(|c| c.is_ascii_alphabetic()) {
            if !matches!(flag, 'i' | 'm') {
                return Err(self.error(self.pos, format!("unsupported regex flag '{}'", flag)));
            }
            self.bump();
            flags.push(flag);
        }
        compile_regex(&pattern, &flags)
            .map_err(|err| self.error(start, format!("invalid regex: {}", err)))?;
        Ok(TokenKind::Regex { pattern, flags })
    }

    fn lex_identifier(&mut self) -> String {
        let start = self.pos;
        while let Some(ch) = self.peek() {
            if is_name_char(ch) {
                self.bump();
            } else {
                break;
            }
        }
        self.source[start..self.pos].to_string()
    }

    fn lex_backtick(&mut self) -> Result<String, ConvertError> {
        let start = self.pos;
        self.bump();
        match self.source[self.pos..].find('`') {
            Some(idx) => {
                let name = self.source[self.pos..self.pos + idx].to_string();
                self.pos += idx + 1;
                Ok(name)
            }
            None => Err(self.error(start, "quoted name has no closing backtick")),
        }
    }

    fn lex_number(&mut self) -> Result<f64, ConvertError> {
        let start = self.pos;
        self.eat_digits();
        if self.peek() == Some('.') && self.peek_at(1).is_some_and(|c| c.is_ascii_digit()) {
            self.bump();
            self.eat_digits();
        }
        if matches!(self.peek(), Some('e' | 'E')) {
            let exp_start = self.pos;
            self.bump();
            if matches!(self.peek(), Some('+' | '-')) {
                self.bump();
            }
            if !self.peek().is_some_and(|c| c.is_ascii_digit()) {
                return Err(self.error(exp_start, "number has an empty exponent"));
            }
            self.eat_digits();
        }
        let text = &self.source[start..self.pos];
        match text.parse::<f64>() {
            Ok(n) if n.is_finite() => Ok(n),
            _ => Err(self.error(start, format!("number out of range: {}", text))),
        }
    }

    fn eat_digits(&mut self) {
        while self.peek().is_some_and(|c| c.is_ascii_digit()) {
            self.bump();
        }
    }

    fn lex_string(&mut self, quote: char) -> Result<String, ConvertError> {
        let start = self.pos;
        self.bump();
        let mut out = String::new();
        loop {
            let ch = match self.bump() {
                Some(ch) => ch,
                None => return Err(self.error(start, "string literal is not terminated")),
            };
            if ch == quote {
                return Ok(out);
            }
            if ch != '\\' {
                out.push(ch);
                continue;
            }
            let escape_at = self.pos - 1;
            match self.bump() {
                Some('"') => out.push('"'),
                Some('\'') => out.push('\''),
                Some('\\') => out.push('\\'),
                Some('/') => out.push('/'),
                Some('b') => out.push('\u{0008}'),
                Some('f') => out.push('\u{000C}'),
                Some('n') => out.push('\n'),
                Some('r') => out.push('\r'),
                Some('t') => out.push('\t'),
                Some('u') => out.push(self.lex_unicode_escape(escape_at)?),
                _ => return Err(self.error(escape_at, "unsupported escape sequence")),
            }
        }
    }

    fn lex_unicode_escape(&mut self, escape_at: usize) -> Result<char, ConvertError> {
        let high = self.lex_hex4(escape_at)?;
        if (0xD800..0xDC00).contains(&high) {
            if self.source[self.pos..].starts_with("\\u") {
                self.pos += 2;
                let low = self.lex_hex4(escape_at)?;
                if (0xDC00..0xE000).contains(&low) {
                    let code = 0x10000 + ((high - 0xD800) << 10) + (low - 0xDC00);
                    if let Some(ch) = char::from_u32(code) {
                        return Ok(ch);
                    }
                }
            }
            return Err(self.error(escape_at, "invalid surrogate pair in \\u escape"));
        }
        char::from_u32(high).ok_or_else(|| self.error(escape_at, "invalid \\u escape"))
    }

    fn lex_hex4(&mut self, escape_at: usize) -> Result<u32, ConvertError> {
        let digits = self
            .source
            .get(self.pos..self.pos + 4)
            .filter(|d| d.chars().all(|c| c.is_ascii_hexdigit()))
            .ok_or_else(|| self.error(escape_at, "\\u escape needs four hex digits"))?;
        let code = u32::from_str_radix(digits, 16)
            .map_err(|_| self.error(escape_at, "\\u escape needs four hex digits"))?;
        self.pos += 4;
        Ok(code)
    }

    fn lex_operator(&mut self, ch: char, start: usize) -> Result<TokenKind, ConvertError> {
        let next = self.peek_at(1);
        let (kind, width) = match (ch, next) {
            ('.', Some('.')) => (TokenKind::DotDot, 2),
            (':', Some('=')) => (TokenKind::Assign, 2),
            ('!', Some('=')) => (TokenKind::Ne, 2),
            ('<', Some('=')) => (TokenKind::Lte, 2),
            ('>', Some('=')) => (TokenKind::Gte, 2),
            ('~', Some('>')) => (TokenKind::Chain, 2),
            ('.', _) => (TokenKind::Dot, 1),
            ('[', _) => (TokenKind::LBracket, 1),
            (']', _) => (TokenKind::RBracket, 1),
            ('{', _) => (TokenKind::LBrace, 1),
            ('}', _) => (TokenKind::RBrace, 1),
            ('(', _) => (TokenKind::LParen, 1),
            (')', _) => (TokenKind::RParen, 1),
            (',', _) => (TokenKind::Comma, 1),
            (':', _) => (TokenKind::Colon, 1),
            (';', _) => (TokenKind::Semicolon, 1),
            ('?', _) => (TokenKind::Question, 1),
            ('&', _) => (TokenKind::Amp, 1),
            ('+', _) => (TokenKind::Plus, 1),
            ('-', _) => (TokenKind::Minus, 1),
            ('*', _) => (TokenKind::Star, 1),
            ('/', _) => (TokenKind::Slash, 1),
            ('%', _) => (TokenKind::Percent, 1),
            ('=', _) => (TokenKind::Eq, 1),
            ('<', _) => (TokenKind::Lt, 1),
            ('>', _) => (TokenKind::Gt, 1),
            _ => return Err(self.error(start, format!("unexpected character '{}'", ch))),
        };
        for _ in 0..width {
            self.bump();
        }
        Ok(kind)
    }
}

fn is_name_start(ch: char) -> bool {
    ch == '_' || ch.is_alphabetic()
}

fn is_name_char(ch: char) -> bool {
    ch == '_' || ch.is_alphanumeric()
}
