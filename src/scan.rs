use std::fmt;

use crate::{
    token::{self, Token},
    Position,
};

/// Error while scanning source code
#[derive(Debug, Clone)]
pub enum ScanError {
    /// A string literal is unterminated; the position is its opening quote
    UnterminatedString(Position),
    /// Invalid character
    UnexpectedCharacter(Position, char),
}
impl std::error::Error for ScanError {}
impl fmt::Display for ScanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnterminatedString(pos) => write!(f, "{} Error: Unterminated string.", pos),
            Self::UnexpectedCharacter(pos, c) => {
                write!(f, "{} Error: Unexpected character '{}'.", pos, c)
            }
        }
    }
}

/// Cuts the source text into tokens, one call at a time.
///
/// The scanner keeps two byte offsets into the source: where the current
/// lexeme started and where the cursor sits. A finished token's lexeme is
/// the slice between them, so nothing is buffered and nothing past the next
/// character is ever inspected. Both offsets have a [`Position`] tracked
/// alongside them; tokens and errors report the position the lexeme began
/// at.
#[derive(Debug)]
pub struct Scanner<'a> {
    src: &'a str,
    start: usize,
    current: usize,
    start_pos: Position,
    pos: Position,
}

impl<'a> Scanner<'a> {
    /// Create a scanner at the beginning of the given source.
    pub fn new(src: &'a str) -> Self {
        Self {
            src,
            start: 0,
            current: 0,
            start_pos: Position::default(),
            pos: Position::default(),
        }
    }

    /// Consume and return the next token, or `None` at the end of source.
    pub fn scan(&mut self) -> Result<Option<Token>, ScanError> {
        self.skip_blanks();
        self.start = self.current;
        self.start_pos = self.pos;

        let c = match self.advance() {
            None => return Ok(None),
            Some(c) => c,
        };
        let typ = match c {
            '(' => token::Type::LParen,
            ')' => token::Type::RParen,
            '{' => token::Type::LBrace,
            '}' => token::Type::RBrace,
            ';' => token::Type::Semicolon,
            ',' => token::Type::Comma,
            '.' => token::Type::Dot,
            '-' => token::Type::Minus,
            '+' => token::Type::Plus,
            '/' => token::Type::Slash,
            '*' => token::Type::Star,
            '!' => self.either('=', token::Type::BangEqual, token::Type::Bang),
            '=' => self.either('=', token::Type::EqualEqual, token::Type::Equal),
            '<' => self.either('=', token::Type::LessEqual, token::Type::Less),
            '>' => self.either('=', token::Type::GreaterEqual, token::Type::Greater),
            '"' => self.string_literal()?,
            c if c.is_ascii_digit() => self.number_literal(),
            c if is_name_start(c) => self.name(),
            c => return Err(ScanError::UnexpectedCharacter(self.start_pos, c)),
        };
        Ok(Some(self.token(typ)))
    }

    /// A name is either a reserved word or an identifier; only the keyword
    /// table knows which.
    fn name(&mut self) -> token::Type {
        while matches!(self.peek(), Some(c) if is_name_start(c) || c.is_ascii_digit()) {
            self.advance();
        }
        token::Type::keyword(self.lexeme()).unwrap_or(token::Type::Ident)
    }

    /// Digits with an optional fraction. The dot is only consumed when a
    /// digit follows it, so `7.` scans as a number and then a dot.
    fn number_literal(&mut self) -> token::Type {
        self.take_digits();
        if self.peek() == Some('.') && self.peek_next().map_or(false, |c| c.is_ascii_digit()) {
            self.advance();
            self.take_digits();
        }
        token::Type::Number
    }

    fn take_digits(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
            self.advance();
        }
    }

    /// Consume up to and including the closing quote. No escape sequences
    /// are recognized; a newline inside a literal is part of the string.
    fn string_literal(&mut self) -> Result<token::Type, ScanError> {
        loop {
            match self.advance() {
                Some('"') => return Ok(token::Type::String),
                Some(_) => {}
                None => return Err(ScanError::UnterminatedString(self.start_pos)),
            }
        }
    }

    fn skip_blanks(&mut self) {
        loop {
            match self.peek() {
                Some(c) if c.is_ascii_whitespace() => {
                    self.advance();
                }
                Some('/') if self.peek_next() == Some('/') => {
                    while matches!(self.peek(), Some(c) if c != '\n') {
                        self.advance();
                    }
                }
                _ => return,
            }
        }
    }

    fn either(&mut self, next: char, matched: token::Type, lone: token::Type) -> token::Type {
        if self.take(next) {
            matched
        } else {
            lone
        }
    }

    fn take(&mut self, expected: char) -> bool {
        if self.peek() == Some(expected) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn advance(&mut self) -> Option<char> {
        let c = self.rest().chars().next()?;
        self.current += c.len_utf8();
        self.pos.advance(c);
        Some(c)
    }

    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn peek_next(&self) -> Option<char> {
        let mut chars = self.rest().chars();
        chars.next();
        chars.next()
    }

    fn rest(&self) -> &'a str {
        &self.src[self.current..]
    }

    fn lexeme(&self) -> &'a str {
        &self.src[self.start..self.current]
    }

    fn token(&self, typ: token::Type) -> Token {
        Token {
            typ,
            lexeme: self.lexeme().to_string(),
            pos: self.start_pos,
        }
    }
}

impl<'a> IntoIterator for Scanner<'a> {
    type Item = Result<Token, ScanError>;
    type IntoIter = Iter<'a>;
    fn into_iter(self) -> Self::IntoIter {
        Iter { scanner: self }
    }
}

/// An iterator over the scanner's tokens
#[derive(Debug)]
pub struct Iter<'a> {
    scanner: Scanner<'a>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = Result<Token, ScanError>;
    fn next(&mut self) -> Option<Self::Item> {
        self.scanner.scan().transpose()
    }
}

fn is_name_start(c: char) -> bool {
    c.is_alphabetic() || c == '_'
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan_all(src: &str) -> Vec<Token> {
        Scanner::new(src)
            .into_iter()
            .collect::<Result<Vec<_>, _>>()
            .expect("valid source")
    }

    #[test]
    fn punctuation_and_operators() {
        let tokens = scan_all("(){};,.-+/* ! != = == < <= > >=");
        let types: Vec<_> = tokens.iter().map(|t| t.typ).collect();
        assert_eq!(
            types,
            vec![
                token::Type::LParen,
                token::Type::RParen,
                token::Type::LBrace,
                token::Type::RBrace,
                token::Type::Semicolon,
                token::Type::Comma,
                token::Type::Dot,
                token::Type::Minus,
                token::Type::Plus,
                token::Type::Slash,
                token::Type::Star,
                token::Type::Bang,
                token::Type::BangEqual,
                token::Type::Equal,
                token::Type::EqualEqual,
                token::Type::Less,
                token::Type::LessEqual,
                token::Type::Greater,
                token::Type::GreaterEqual,
            ]
        );
    }

    #[test]
    fn keywords_and_identifiers() {
        let tokens = scan_all("class classy fun funny var _x x1");
        let types: Vec<_> = tokens.iter().map(|t| t.typ).collect();
        assert_eq!(
            types,
            vec![
                token::Type::Class,
                token::Type::Ident,
                token::Type::Fun,
                token::Type::Ident,
                token::Type::Var,
                token::Type::Ident,
                token::Type::Ident,
            ]
        );
        assert_eq!(tokens[1].lexeme, "classy");
        assert_eq!(tokens[5].lexeme, "_x");
    }

    #[test]
    fn numbers() {
        let tokens = scan_all("1 12.5 7.");
        assert_eq!(tokens[0].typ, token::Type::Number);
        assert_eq!(tokens[0].lexeme, "1");
        assert_eq!(tokens[1].typ, token::Type::Number);
        assert_eq!(tokens[1].lexeme, "12.5");
        // A trailing dot is not part of the number.
        assert_eq!(tokens[2].typ, token::Type::Number);
        assert_eq!(tokens[2].lexeme, "7");
        assert_eq!(tokens[3].typ, token::Type::Dot);
    }

    #[test]
    fn string_literal_keeps_quotes_in_lexeme() {
        let tokens = scan_all("\"hi there\"");
        assert_eq!(tokens[0].typ, token::Type::String);
        assert_eq!(tokens[0].lexeme, "\"hi there\"");
    }

    #[test]
    fn line_comments_are_skipped_but_slash_is_not() {
        let tokens = scan_all("1 // comment\n2 / 3");
        let types: Vec<_> = tokens.iter().map(|t| t.typ).collect();
        assert_eq!(
            types,
            vec![
                token::Type::Number,
                token::Type::Number,
                token::Type::Slash,
                token::Type::Number,
            ]
        );
    }

    #[test]
    fn tokens_record_where_their_lexeme_starts() {
        let tokens = scan_all("a\nbb\n  c");
        assert_eq!(tokens[0].pos, Position { line: 1, column: 1 });
        assert_eq!(tokens[1].pos, Position { line: 2, column: 1 });
        assert_eq!(tokens[2].pos, Position { line: 3, column: 3 });
    }

    #[test]
    fn multi_line_strings_advance_the_line_count() {
        let tokens = scan_all("\"one\ntwo\" x");
        assert_eq!(tokens[0].typ, token::Type::String);
        assert_eq!(tokens[0].pos, Position { line: 1, column: 1 });
        assert_eq!(tokens[1].pos.line, 2);
    }

    #[test]
    fn unterminated_string_points_at_the_opening_quote() {
        let mut scanner = Scanner::new("  \"oops");
        match scanner.scan() {
            Err(ScanError::UnterminatedString(pos)) => {
                assert_eq!(pos, Position { line: 1, column: 3 });
            }
            other => panic!("expected an unterminated string error, got {:?}", other),
        }
    }

    #[test]
    fn unexpected_character_is_an_error() {
        let mut scanner = Scanner::new("@");
        assert!(matches!(
            scanner.scan(),
            Err(ScanError::UnexpectedCharacter(_, '@'))
        ));
    }
}
