//! Recursive-descent parser producing the expression AST.
//!
//! Grammar, loosest binding first:
//!
//! ```text
//! or      := and ( "||" and )*
//! and     := cmp ( "&&" cmp )*
//! cmp     := add ( ("=="|"!="|"==="|"!=="|"<"|">"|"<="|">=") add )?
//! add     := mul ( ("+"|"-") mul )*
//! mul     := unary ( ("*"|"/") unary )*
//! unary   := ("!"|"-") unary | primary
//! primary := literal | "(" or ")" | call | path
//! path    := ident ( "." ident | "[" int "]" | "[" "-" int "]" | "[" "*" "]" )*
//! call    := ident "(" ( or ( "," or )* )? ")"
//! ```

use serde_json::Value;

use super::token::{tokenize, Tok, Token};
use super::ExprError;

/// One segment of a resolved path.
#[derive(Debug, Clone, PartialEq)]
pub enum Seg {
    /// Object field access (own keys only).
    Key(String),
    /// Array index; negative counts from the end.
    Index(i64),
    /// `[*]` projection over an array.
    Wildcard,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    LooseEq,
    LooseNe,
    StrictEq,
    StrictNe,
    Lt,
    Gt,
    Le,
    Ge,
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Path(Vec<Seg>),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>),
}

/// Parse an expression string into an AST.
pub fn parse(src: &str) -> Result<Expr, ExprError> {
    let tokens = tokenize(src)?;
    let mut p = Parser { tokens, pos: 0 };
    let expr = p.parse_or()?;
    if let Some(t) = p.peek() {
        return Err(ExprError::Parse {
            pos: t.pos,
            message: "unexpected trailing input".to_string(),
        });
    }
    Ok(expr)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn eat(&mut self, want: &Tok) -> bool {
        if self.peek().map(|t| &t.tok) == Some(want) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, want: Tok, what: &str) -> Result<(), ExprError> {
        match self.next() {
            Some(t) if t.tok == want => Ok(()),
            Some(t) => Err(ExprError::Parse {
                pos: t.pos,
                message: format!("expected {}", what),
            }),
            None => Err(ExprError::Parse {
                pos: usize::MAX,
                message: format!("expected {}, found end of input", what),
            }),
        }
    }

    fn parse_or(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.parse_and()?;
        while self.eat(&Tok::OrOr) {
            let rhs = self.parse_and()?;
            lhs = Expr::Binary(BinaryOp::Or, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.parse_cmp()?;
        while self.eat(&Tok::AndAnd) {
            let rhs = self.parse_cmp()?;
            lhs = Expr::Binary(BinaryOp::And, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_cmp(&mut self) -> Result<Expr, ExprError> {
        let lhs = self.parse_add()?;
        let op = match self.peek().map(|t| &t.tok) {
            Some(Tok::EqEqEq) => Some(BinaryOp::StrictEq),
            Some(Tok::NotEqEq) => Some(BinaryOp::StrictNe),
            Some(Tok::EqEq) => Some(BinaryOp::LooseEq),
            Some(Tok::NotEq) => Some(BinaryOp::LooseNe),
            Some(Tok::Lt) => Some(BinaryOp::Lt),
            Some(Tok::Gt) => Some(BinaryOp::Gt),
            Some(Tok::Le) => Some(BinaryOp::Le),
            Some(Tok::Ge) => Some(BinaryOp::Ge),
            _ => None,
        };
        match op {
            Some(op) => {
                self.pos += 1;
                let rhs = self.parse_add()?;
                Ok(Expr::Binary(op, Box::new(lhs), Box::new(rhs)))
            }
            None => Ok(lhs),
        }
    }

    fn parse_add(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.parse_mul()?;
        loop {
            let op = match self.peek().map(|t| &t.tok) {
                Some(Tok::Plus) => BinaryOp::Add,
                Some(Tok::Minus) => BinaryOp::Sub,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.parse_mul()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_mul(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.peek().map(|t| &t.tok) {
                Some(Tok::Star) => BinaryOp::Mul,
                Some(Tok::Slash) => BinaryOp::Div,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.parse_unary()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr, ExprError> {
        if self.eat(&Tok::Bang) {
            let inner = self.parse_unary()?;
            return Ok(Expr::Unary(UnaryOp::Not, Box::new(inner)));
        }
        if self.eat(&Tok::Minus) {
            let inner = self.parse_unary()?;
            return Ok(Expr::Unary(UnaryOp::Neg, Box::new(inner)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, ExprError> {
        let t = self.next().ok_or(ExprError::Parse {
            pos: usize::MAX,
            message: "unexpected end of expression".to_string(),
        })?;

        match t.tok {
            Tok::Number(n) => Ok(Expr::Literal(number_value(n))),
            Tok::Str(s) => Ok(Expr::Literal(Value::String(s))),
            Tok::True => Ok(Expr::Literal(Value::Bool(true))),
            Tok::False => Ok(Expr::Literal(Value::Bool(false))),
            Tok::Null => Ok(Expr::Literal(Value::Null)),
            Tok::LParen => {
                let inner = self.parse_or()?;
                self.expect(Tok::RParen, "')'")?;
                Ok(inner)
            }
            Tok::Ident(name) => {
                if self.peek().map(|t| &t.tok) == Some(&Tok::LParen) {
                    self.pos += 1;
                    let mut args = Vec::new();
                    if !self.eat(&Tok::RParen) {
                        loop {
                            args.push(self.parse_or()?);
                            if self.eat(&Tok::Comma) {
                                continue;
                            }
                            self.expect(Tok::RParen, "')' after arguments")?;
                            break;
                        }
                    }
                    return Ok(Expr::Call(name, args));
                }
                let mut segs = vec![Seg::Key(name)];
                self.parse_path_tail(&mut segs)?;
                Ok(Expr::Path(segs))
            }
            other => Err(ExprError::Parse {
                pos: t.pos,
                message: format!("unexpected token {:?}", other),
            }),
        }
    }

    fn parse_path_tail(&mut self, segs: &mut Vec<Seg>) -> Result<(), ExprError> {
        loop {
            if self.eat(&Tok::Dot) {
                match self.next() {
                    Some(Token { tok: Tok::Ident(k), .. }) => segs.push(Seg::Key(k)),
                    // "items.0" style numeric segments act as indices.
                    Some(Token { tok: Tok::Number(n), .. }) if n.fract() == 0.0 => {
                        segs.push(Seg::Index(n as i64))
                    }
                    Some(t) => {
                        return Err(ExprError::Parse {
                            pos: t.pos,
                            message: "expected field name after '.'".to_string(),
                        })
                    }
                    None => {
                        return Err(ExprError::Parse {
                            pos: usize::MAX,
                            message: "expected field name after '.'".to_string(),
                        })
                    }
                }
            } else if self.eat(&Tok::LBracket) {
                let seg = match self.next() {
                    Some(Token { tok: Tok::Star, .. }) => Seg::Wildcard,
                    Some(Token { tok: Tok::Number(n), .. }) if n.fract() == 0.0 => {
                        Seg::Index(n as i64)
                    }
                    Some(Token { tok: Tok::Minus, .. }) => match self.next() {
                        Some(Token { tok: Tok::Number(n), .. }) if n.fract() == 0.0 => {
                            Seg::Index(-(n as i64))
                        }
                        _ => {
                            return Err(ExprError::Parse {
                                pos: usize::MAX,
                                message: "expected integer index after '-'".to_string(),
                            })
                        }
                    },
                    Some(Token { tok: Tok::Str(k), .. }) => Seg::Key(k),
                    other => {
                        return Err(ExprError::Parse {
                            pos: other.map(|t| t.pos).unwrap_or(usize::MAX),
                            message: "expected index, '*', or key inside '[]'".to_string(),
                        })
                    }
                };
                self.expect(Tok::RBracket, "']'")?;
                segs.push(seg);
            } else {
                return Ok(());
            }
        }
    }
}

/// Convert an f64 into the narrowest JSON number.
pub(super) fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < (i64::MAX as f64) {
        Value::Number((n as i64).into())
    } else {
        serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_path_with_indices() {
        let e = parse("items[-1].id").unwrap();
        assert_eq!(
            e,
            Expr::Path(vec![
                Seg::Key("items".into()),
                Seg::Index(-1),
                Seg::Key("id".into())
            ])
        );
    }

    #[test]
    fn parses_wildcard() {
        let e = parse("items[*].id").unwrap();
        assert_eq!(
            e,
            Expr::Path(vec![
                Seg::Key("items".into()),
                Seg::Wildcard,
                Seg::Key("id".into())
            ])
        );
    }

    #[test]
    fn precedence_mul_over_add() {
        let e = parse("1 + 2 * 3").unwrap();
        match e {
            Expr::Binary(BinaryOp::Add, lhs, _) => {
                assert_eq!(*lhs, Expr::Literal(json!(1)));
            }
            other => panic!("unexpected shape: {:?}", other),
        }
    }

    #[test]
    fn precedence_cmp_over_and() {
        let e = parse("a > 1 && b < 2").unwrap();
        assert!(matches!(e, Expr::Binary(BinaryOp::And, _, _)));
    }

    #[test]
    fn call_with_two_args() {
        let e = parse("contains(input.tags, \"beta\")").unwrap();
        match e {
            Expr::Call(name, args) => {
                assert_eq!(name, "contains");
                assert_eq!(args.len(), 2);
            }
            other => panic!("unexpected shape: {:?}", other),
        }
    }

    #[test]
    fn rejects_trailing_tokens() {
        assert!(parse("a b").is_err());
    }
}
