use phf::phf_map;
use thiserror::Error;

pub type Range = (usize, usize);

#[derive(Debug, Error, PartialEq)]
pub enum LexError {
    #[error("unterminated block comment starting at byte {0}")]
    UnterminatedComment(usize),
    #[error("unterminated string literal starting at byte {0}")]
    UnterminatedString(usize),
    #[error("illegal character {ch:?} at byte {at}")]
    IllegalChar { ch: char, at: usize },
}

#[derive(Debug, PartialEq, Clone, Copy)]
pub enum Token {
    /// maximal alphanumeric/underscore run; the parser decides whether it
    /// is a number or an identifier
    Word(Range),
    String(Range),
    /// statement terminator
    Newline,
    // keywords
    Fn,
    If,
    Else,
    Loop,
    Break,
    Continue,
    Return,
    // two-character operators, matched greedily
    EqEq,
    BangEq,
    AndAnd,
    OrOr,
    LtEq,
    GtEq,
    Shl,
    Shr,
    Arrow,
    // single-character operators and delimiters
    LParen,
    RParen,
    LSquirly,
    RSquirly,
    Semi,
    Comma,
    Colon,
    Dot,
    Star,
    Percent,
    Amp,
    Pipe,
    Caret,
    Tilde,
    Lt,
    Gt,
    Bang,
    Eq,
    Plus,
    Minus,
    Slash,
    Eof,
}

/// A token plus the byte offset it starts at.
#[derive(Debug, PartialEq, Clone, Copy)]
pub struct Spanned {
    pub tok: Token,
    pub at: usize,
}

static KEYWORDS: phf::Map<&'static [u8], Token> = phf_map! {
    b"fn" => Token::Fn,
    b"if" => Token::If,
    b"else" => Token::Else,
    b"loop" => Token::Loop,
    b"break" => Token::Break,
    b"continue" => Token::Continue,
    b"return" => Token::Return,
};

pub struct Lexer<'a> {
    position: usize,
    read_position: usize,
    ch: u8,
    input: &'a [u8],
}

impl<'a> Lexer<'a> {
    pub fn new(input: &'a str) -> Self {
        let mut lex = Self {
            position: 0,
            read_position: 0,
            ch: 0,
            input: input.as_bytes(),
        };
        lex.step();

        return lex;
    }

    pub fn tokenize(mut self) -> Result<Vec<Spanned>, LexError> {
        let mut tokens = Vec::new();
        loop {
            let spanned = self.next_token()?;
            let done = spanned.tok == Token::Eof;
            tokens.push(spanned);
            if done {
                return Ok(tokens);
            }
        }
    }

    pub fn next_token(&mut self) -> Result<Spanned, LexError> {
        loop {
            self.skip_blank();
            match self.ch {
                b'/' if self.peek() == b'/' => self.skip_line_comment(),
                b'/' if self.peek() == b'*' => self.skip_block_comment()?,
                _ => break,
            }
        }

        let at = self.position;
        let tok = match self.ch {
            0 => Token::Eof,
            b'\n' => {
                self.step();
                Token::Newline
            }
            b'"' => self.read_string()?,
            b'a'..=b'z' | b'A'..=b'Z' | b'_' | b'0'..=b'9' => self.read_word(),
            _ => self.read_symbol()?,
        };
        return Ok(Spanned { tok, at });
    }

    fn step(&mut self) {
        self.ch = self.peek();

        self.position = self.read_position;
        self.read_position += 1;
    }

    fn step_while<F>(&mut self, f: F)
    where
        F: Fn(u8) -> bool,
    {
        while f(self.ch) {
            self.step();
        }
    }

    fn peek(&self) -> u8 {
        return if self.read_position >= self.input.len() {
            0
        } else {
            self.input[self.read_position]
        };
    }

    fn skip_blank(&mut self) {
        self.step_while(|ch| ch == b' ' || ch == b'\t' || ch == b'\r');
    }

    fn skip_line_comment(&mut self) {
        // leave the newline for the main loop, it terminates a statement
        self.step_while(|ch| ch != b'\n' && ch != 0);
    }

    fn skip_block_comment(&mut self) -> Result<(), LexError> {
        let start = self.position;
        self.step();
        self.step();
        loop {
            if self.ch == 0 {
                return Err(LexError::UnterminatedComment(start));
            }
            if self.ch == b'*' && self.peek() == b'/' {
                self.step();
                self.step();
                return Ok(());
            }
            self.step();
        }
    }

    fn read_word(&mut self) -> Token {
        let pos = self.position;
        self.step_while(|ch| ch.is_ascii_alphanumeric() || ch == b'_');
        let range = (pos, self.position);
        debug_assert_ne!(range.0, range.1);
        if let Some(kw) = KEYWORDS.get(self.slice(&range)) {
            return *kw;
        }
        return Token::Word(range);
    }

    fn read_string(&mut self) -> Result<Token, LexError> {
        let start = self.position;
        self.step();
        let content = self.position;
        self.step_while(|ch| ch != b'"' && ch != 0);
        if self.ch == 0 {
            return Err(LexError::UnterminatedString(start));
        }
        let range = (content, self.position);
        self.step();
        return Ok(Token::String(range));
    }

    fn read_symbol(&mut self) -> Result<Token, LexError> {
        macro_rules! if_peek {
            ($char:literal, $a:expr, $b:expr) => {
                match self.peek() {
                    $char => {
                        self.step();
                        $a
                    }
                    _ => $b,
                }
            };
        }
        let tok = match self.ch {
            b'=' => if_peek!(b'=', Token::EqEq, Token::Eq),
            b'!' => if_peek!(b'=', Token::BangEq, Token::Bang),
            b'&' => if_peek!(b'&', Token::AndAnd, Token::Amp),
            b'|' => if_peek!(b'|', Token::OrOr, Token::Pipe),
            b'<' => match self.peek() {
                b'=' => {
                    self.step();
                    Token::LtEq
                }
                b'<' => {
                    self.step();
                    Token::Shl
                }
                _ => Token::Lt,
            },
            b'>' => match self.peek() {
                b'=' => {
                    self.step();
                    Token::GtEq
                }
                b'>' => {
                    self.step();
                    Token::Shr
                }
                _ => Token::Gt,
            },
            b'-' => if_peek!(b'>', Token::Arrow, Token::Minus),
            b'(' => Token::LParen,
            b')' => Token::RParen,
            b'{' => Token::LSquirly,
            b'}' => Token::RSquirly,
            b';' => Token::Semi,
            b',' => Token::Comma,
            b':' => Token::Colon,
            b'.' => Token::Dot,
            b'*' => Token::Star,
            b'%' => Token::Percent,
            b'^' => Token::Caret,
            b'~' => Token::Tilde,
            b'+' => Token::Plus,
            b'/' => Token::Slash,
            ch => {
                return Err(LexError::IllegalChar {
                    ch: ch as char,
                    at: self.position,
                })
            }
        };
        self.step();
        return Ok(tok);
    }

    pub fn slice(&self, range: &Range) -> &[u8] {
        let (start, end) = *range;
        debug_assert!(end <= self.input.len());
        return &self.input[start..end];
    }
}
