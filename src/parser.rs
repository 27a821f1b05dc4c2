use thiserror::Error;

use crate::ast::{Ast, Binop, LabelId, NIndex, Node, UnOp, XIndex};
use crate::lexer::{Range, Spanned, Token};

#[derive(Debug, Error, PartialEq)]
pub enum ParseError {
    #[error("unexpected {found} at byte {at}, expected {expected}")]
    Unexpected {
        found: String,
        expected: &'static str,
        at: usize,
    },
    #[error("`{word}` outside of a loop at byte {at}")]
    OutsideLoop { word: &'static str, at: usize },
    #[error("invalid assignment target at byte {at}, expected `&name` or `*addr`")]
    BadAssignTarget { at: usize },
    #[error("`&` must be applied to a variable name at byte {at}")]
    AddrOfTarget { at: usize },
    #[error("invalid numeric literal `{lit}`")]
    BadNumber { lit: String },
    #[error("string literals have no value in expressions (byte {at})")]
    StringValue { at: usize },
}

/// assignment binds tighter than the comma operator and looser than `||`
const ASSIGN_BP: u8 = 3;

macro_rules! eat {
    ($self:ident, $pat:pat, $expected:literal) => {
        match $self.at() {
            tok @ $pat => {
                $self.bump();
                Ok(tok)
            }
            tok => Err(ParseError::Unexpected {
                found: format!("{:?}", tok),
                expected: $expected,
                at: $self.at_byte(),
            }),
        }
    };
}

pub struct Parser<'a> {
    src: &'a [u8],
    tokens: Vec<Spanned>,
    pos: usize,
    ast: Ast,
    /// (start label, end label) of each enclosing `loop`, innermost last
    loops: Vec<(LabelId, LabelId)>,
}

impl<'a> Parser<'a> {
    pub fn new(src: &'a str, tokens: Vec<Spanned>) -> Self {
        debug_assert!(matches!(tokens.last(), Some(Spanned { tok: Token::Eof, .. })));
        Parser {
            src: src.as_bytes(),
            tokens,
            pos: 0,
            ast: Ast::new(),
            loops: Vec::new(),
        }
    }

    pub fn parse(mut self) -> Result<Ast, ParseError> {
        let mut top = Vec::new();
        loop {
            self.skip_terminators();
            match self.at() {
                Token::Eof => break,
                Token::Fn => {
                    let f = self.fundef()?;
                    top.push(f as u32);
                }
                _ => {
                    let s = self.stmt()?;
                    top.push(s as u32);
                    self.stmt_end()?;
                }
            }
        }
        self.ast.top = self.ast.extra.append(&top);
        Ok(self.ast)
    }

    fn at(&self) -> Token {
        return self.tokens[self.pos].tok;
    }

    fn at_byte(&self) -> usize {
        return self.tokens[self.pos].at;
    }

    fn bump(&mut self) {
        if self.at() != Token::Eof {
            self.pos += 1;
        }
    }

    fn text(&self, range: Range) -> &'a str {
        return std::str::from_utf8(&self.src[range.0..range.1]).unwrap();
    }

    fn skip_terminators(&mut self) {
        while matches!(self.at(), Token::Newline | Token::Semi) {
            self.bump();
        }
    }

    fn stmt_end(&mut self) -> Result<(), ParseError> {
        match self.at() {
            Token::Newline | Token::Semi => {
                self.bump();
                Ok(())
            }
            Token::Eof => Ok(()),
            tok => Err(ParseError::Unexpected {
                found: format!("{:?}", tok),
                expected: "end of statement",
                at: self.at_byte(),
            }),
        }
    }

    fn fundef(&mut self) -> Result<NIndex, ParseError> {
        eat!(self, Token::Fn, "`fn`")?;
        let Token::Word(name) = eat!(self, Token::Word(_), "function name")? else {
            unreachable!()
        };
        self.require_ident(name)?;
        eat!(self, Token::LParen, "`(`")?;
        let mut params = Vec::new();
        if self.at() != Token::RParen {
            loop {
                let Token::Word(range) = eat!(self, Token::Word(_), "parameter name")? else {
                    unreachable!()
                };
                self.require_ident(range)?;
                let p = self.ast.push(Node::Ident(range));
                params.push(p as u32);
                if self.at() == Token::Comma {
                    self.bump();
                } else {
                    break;
                }
            }
        }
        eat!(self, Token::RParen, "`)`")?;
        let entry_label = self.ast.new_label();
        let skip_label = self.ast.new_label();
        let body = self.block()?;
        let params = self.ast.extra.append(&params);
        Ok(self.ast.push(Node::FunDef {
            name,
            params,
            body,
            entry_label,
            skip_label,
        }))
    }

    fn block(&mut self) -> Result<XIndex, ParseError> {
        eat!(self, Token::LSquirly, "`{`")?;
        let mut stmts = Vec::new();
        loop {
            self.skip_terminators();
            if self.at() == Token::RSquirly {
                self.bump();
                break;
            }
            if self.at() == Token::Eof {
                return Err(ParseError::Unexpected {
                    found: "Eof".to_string(),
                    expected: "`}`",
                    at: self.at_byte(),
                });
            }
            let s = self.stmt()?;
            stmts.push(s as u32);
            match self.at() {
                Token::Newline | Token::Semi => self.bump(),
                // the loop top reports a missing `}` for Eof
                Token::RSquirly | Token::Eof => {}
                tok => {
                    return Err(ParseError::Unexpected {
                        found: format!("{:?}", tok),
                        expected: "end of statement",
                        at: self.at_byte(),
                    })
                }
            }
        }
        Ok(self.ast.extra.append(&stmts))
    }

    fn stmt(&mut self) -> Result<NIndex, ParseError> {
        match self.at() {
            Token::Break => {
                let at = self.at_byte();
                self.bump();
                let Some(&(_, end)) = self.loops.last() else {
                    return Err(ParseError::OutsideLoop { word: "break", at });
                };
                let value = self.expr()?;
                Ok(self.ast.push(Node::Break { value, target: end }))
            }
            Token::Continue => {
                let at = self.at_byte();
                self.bump();
                let Some(&(start, _)) = self.loops.last() else {
                    return Err(ParseError::OutsideLoop {
                        word: "continue",
                        at,
                    });
                };
                Ok(self.ast.push(Node::Continue { target: start }))
            }
            Token::Return => {
                self.bump();
                let value = match self.at() {
                    Token::Newline | Token::Semi | Token::RSquirly | Token::Eof => None,
                    _ => Some(self.expr()?),
                };
                Ok(self.ast.push(Node::Return { value }))
            }
            Token::If => self.if_stmt(),
            _ => self.expr(),
        }
    }

    fn if_stmt(&mut self) -> Result<NIndex, ParseError> {
        self.bump();
        eat!(self, Token::LParen, "`(`")?;
        let cond = self.expr()?;
        eat!(self, Token::RParen, "`)`")?;
        let else_label = self.ast.new_label();
        let end_label = self.ast.new_label();
        let then_blk = self.block()?;
        let else_blk = if self.at() == Token::Else {
            self.bump();
            self.block()?
        } else {
            self.ast.extra.append(&[])
        };
        Ok(self.ast.push(Node::If {
            cond,
            then_blk,
            else_blk,
            else_label,
            end_label,
        }))
    }

    fn expr(&mut self) -> Result<NIndex, ParseError> {
        return self.expr_bp(0);
    }

    fn expr_bp(&mut self, min_bp: u8) -> Result<NIndex, ParseError> {
        let mut lhs = self.unary()?;
        loop {
            let tok = self.at();
            if tok == Token::Eq {
                if ASSIGN_BP < min_bp {
                    break;
                }
                let at = self.at_byte();
                if !matches!(self.ast.nodes[lhs], Node::AddrOf { .. } | Node::Deref { .. }) {
                    return Err(ParseError::BadAssignTarget { at });
                }
                self.bump();
                // right-associative: parse the value at the same level
                let value = self.expr_bp(ASSIGN_BP)?;
                lhs = self.ast.push(Node::Assign { target: lhs, value });
                continue;
            }
            let Some((op, lbp)) = binop_power(tok) else {
                break;
            };
            if lbp < min_bp {
                break;
            }
            self.bump();
            let rhs = self.expr_bp(lbp + 1)?;
            lhs = self.ast.push(Node::Binop { op, lhs, rhs });
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<NIndex, ParseError> {
        match self.at() {
            Token::Plus => {
                // unary plus is the identity
                self.bump();
                self.unary()
            }
            Token::Minus => self.unary_op(UnOp::Neg),
            Token::Bang => self.unary_op(UnOp::Not),
            Token::Tilde => self.unary_op(UnOp::Inv),
            Token::Star => {
                self.bump();
                let addr = self.unary()?;
                Ok(self.ast.push(Node::Deref { addr }))
            }
            Token::Amp => {
                let at = self.at_byte();
                self.bump();
                let Token::Word(range) = eat!(self, Token::Word(_), "variable name")? else {
                    unreachable!()
                };
                if self.src[range.0].is_ascii_digit() {
                    return Err(ParseError::AddrOfTarget { at });
                }
                let target = self.ast.push(Node::Ident(range));
                Ok(self.ast.push(Node::AddrOf { target }))
            }
            _ => self.primary(),
        }
    }

    fn unary_op(&mut self, op: UnOp) -> Result<NIndex, ParseError> {
        self.bump();
        let operand = self.unary()?;
        Ok(self.ast.push(Node::Unary { op, operand }))
    }

    fn primary(&mut self) -> Result<NIndex, ParseError> {
        let at = self.at_byte();
        match self.at() {
            Token::LParen => {
                self.bump();
                let inner = self.expr()?;
                eat!(self, Token::RParen, "`)`")?;
                Ok(inner)
            }
            Token::Loop => self.loop_expr(),
            Token::Word(range) => {
                self.bump();
                if self.src[range.0].is_ascii_digit() {
                    return self.int_literal(range);
                }
                if self.at() == Token::LParen {
                    return self.call(range);
                }
                Ok(self.ast.push(Node::Ident(range)))
            }
            Token::String(_) => Err(ParseError::StringValue { at }),
            tok => Err(ParseError::Unexpected {
                found: format!("{:?}", tok),
                expected: "an expression",
                at,
            }),
        }
    }

    fn int_literal(&mut self, range: Range) -> Result<NIndex, ParseError> {
        let text = self.text(range);
        let Ok(value) = text.parse::<i64>() else {
            return Err(ParseError::BadNumber {
                lit: text.to_string(),
            });
        };
        Ok(self.ast.push(Node::Int(value)))
    }

    fn call(&mut self, name: Range) -> Result<NIndex, ParseError> {
        self.bump();
        let mut args = Vec::new();
        if self.at() != Token::RParen {
            loop {
                // a comma separates arguments rather than sequencing them
                let a = self.expr_bp(ASSIGN_BP)?;
                args.push(a as u32);
                if self.at() == Token::Comma {
                    self.bump();
                } else {
                    break;
                }
            }
        }
        eat!(self, Token::RParen, "`)`")?;
        let args = self.ast.extra.append(&args);
        Ok(self.ast.push(Node::Call { name, args }))
    }

    fn loop_expr(&mut self) -> Result<NIndex, ParseError> {
        self.bump();
        let start_label = self.ast.new_label();
        let end_label = self.ast.new_label();
        self.loops.push((start_label, end_label));
        let body = self.block();
        self.loops.pop();
        let body = body?;
        Ok(self.ast.push(Node::Loop {
            body,
            start_label,
            end_label,
        }))
    }

    fn require_ident(&self, range: Range) -> Result<(), ParseError> {
        if self.src[range.0].is_ascii_digit() {
            return Err(ParseError::Unexpected {
                found: format!("`{}`", self.text(range)),
                expected: "a name",
                at: range.0,
            });
        }
        Ok(())
    }
}

fn binop_power(tok: Token) -> Option<(Binop, u8)> {
    let pair = match tok {
        Token::Comma => (Binop::Comma, 1),
        Token::OrOr => (Binop::LogOr, 5),
        Token::AndAnd => (Binop::LogAnd, 7),
        Token::Pipe => (Binop::BitOr, 9),
        Token::Caret => (Binop::BitXor, 11),
        Token::Amp => (Binop::BitAnd, 13),
        Token::EqEq => (Binop::Eq, 15),
        Token::BangEq => (Binop::Ne, 15),
        Token::Lt => (Binop::Lt, 17),
        Token::Gt => (Binop::Gt, 17),
        Token::LtEq => (Binop::LtEq, 17),
        Token::GtEq => (Binop::GtEq, 17),
        Token::Shl => (Binop::Shl, 19),
        Token::Shr => (Binop::Shr, 19),
        Token::Plus => (Binop::Add, 21),
        Token::Minus => (Binop::Sub, 21),
        Token::Star => (Binop::Mul, 23),
        Token::Slash => (Binop::Div, 23),
        Token::Percent => (Binop::Mod, 23),
        _ => return None,
    };
    return Some(pair);
}
