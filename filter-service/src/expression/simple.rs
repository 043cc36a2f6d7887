//! A small arithmetic/boolean expression language.
//!
//! Supports numbers, `'text'`/`"text"` literals, `true`/`false`, variables,
//! `+ - * / %`, comparisons, `== !=`, `&& || !` (also `and or not`), the
//! ternary `cond ? a : b` and parentheses.

use super::{Bindings, CompiledExpression, ExpressionError, ExpressionService, Value};

#[derive(Debug, Clone, Default)]
pub struct SimpleExpressionService;

impl ExpressionService for SimpleExpressionService {
    fn id(&self) -> &str {
        "simple"
    }

    fn compile(&self, expression: &str) -> Result<Box<dyn CompiledExpression>, ExpressionError> {
        let tokens = tokenize(expression)?;
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.ternary()?;
        if let Some((offset, tok)) = parser.tokens.get(parser.pos) {
            return Err(ExpressionError::Syntax {
                offset: *offset,
                reason: format!("unexpected {tok:?}"),
            });
        }
        Ok(Box::new(Parsed(expr)))
    }
}

/// The syntax tree of one expression.
#[derive(Debug)]
struct Parsed(Expr);

impl CompiledExpression for Parsed {
    fn evaluate(&self, bindings: &Bindings) -> Result<Value, ExpressionError> {
        eval(&self.0, bindings)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(f64),
    Str(String),
    Ident(String),
    Op(&'static str),
}

const OPERATORS: [&str; 18] = [
    "==", "!=", "<=", ">=", "&&", "||", "+", "-", "*", "/", "%", "<", ">", "!", "?", ":", "(", ")",
];

fn tokenize(src: &str) -> Result<Vec<(usize, Token)>, ExpressionError> {
    let bytes = src.as_bytes();
    let mut out = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i] as char;
        if c.is_ascii_whitespace() {
            i += 1;
        } else if c.is_ascii_digit() || (c == '.' && bytes.get(i + 1).is_some_and(|b| b.is_ascii_digit())) {
            let start = i;
            while i < bytes.len() && (bytes[i].is_ascii_digit() || bytes[i] == b'.') {
                i += 1;
            }
            let text = &src[start..i];
            let n = text.parse().map_err(|_| ExpressionError::Syntax {
                offset: start,
                reason: format!("invalid number '{text}'"),
            })?;
            out.push((start, Token::Num(n)));
        } else if c.is_ascii_alphabetic() || c == '_' {
            let start = i;
            while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                i += 1;
            }
            let word = &src[start..i];
            let tok = match word {
                "and" => Token::Op("&&"),
                "or" => Token::Op("||"),
                "not" => Token::Op("!"),
                _ => Token::Ident(word.to_string()),
            };
            out.push((start, tok));
        } else if c == '\'' || c == '"' {
            let start = i;
            i += 1;
            let body_start = i;
            while i < bytes.len() && bytes[i] as char != c {
                i += 1;
            }
            if i >= bytes.len() {
                return Err(ExpressionError::Syntax {
                    offset: start,
                    reason: "unterminated string".to_string(),
                });
            }
            out.push((start, Token::Str(src[body_start..i].to_string())));
            i += 1;
        } else {
            let rest = &src[i..];
            let op = OPERATORS
                .iter()
                .find(|op| rest.starts_with(**op))
                .copied()
                .ok_or_else(|| ExpressionError::Syntax {
                    offset: i,
                    reason: format!("unexpected character '{c}'"),
                })?;
            out.push((i, Token::Op(op)));
            i += op.len();
        }
    }
    Ok(out)
}

#[derive(Debug, Clone)]
enum Expr {
    Lit(Value),
    Var(String),
    Unary(&'static str, Box<Expr>),
    Binary(&'static str, Box<Expr>, Box<Expr>),
    Ternary(Box<Expr>, Box<Expr>, Box<Expr>),
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
}

impl Parser {
    fn peek_op(&self) -> Option<&'static str> {
        match self.tokens.get(self.pos) {
            Some((_, Token::Op(op))) => Some(*op),
            _ => None,
        }
    }

    fn offset(&self) -> usize {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map(|(o, _)| *o)
            .unwrap_or(0)
    }

    fn expect(&mut self, op: &'static str) -> Result<(), ExpressionError> {
        if self.peek_op() == Some(op) {
            self.pos += 1;
            Ok(())
        } else {
            Err(ExpressionError::Syntax {
                offset: self.offset(),
                reason: format!("expected '{op}'"),
            })
        }
    }

    fn ternary(&mut self) -> Result<Expr, ExpressionError> {
        let cond = self.binary(0)?;
        if self.peek_op() == Some("?") {
            self.pos += 1;
            let then = self.ternary()?;
            self.expect(":")?;
            let otherwise = self.ternary()?;
            return Ok(Expr::Ternary(Box::new(cond), Box::new(then), Box::new(otherwise)));
        }
        Ok(cond)
    }

    /// Precedence climbing over the binary operator levels.
    fn binary(&mut self, level: usize) -> Result<Expr, ExpressionError> {
        const LEVELS: [&[&str]; 6] = [
            &["||"],
            &["&&"],
            &["==", "!="],
            &["<", "<=", ">", ">="],
            &["+", "-"],
            &["*", "/", "%"],
        ];
        if level == LEVELS.len() {
            return self.unary();
        }
        let mut lhs = self.binary(level + 1)?;
        while let Some(op) = self.peek_op().filter(|op| LEVELS[level].contains(op)) {
            self.pos += 1;
            let rhs = self.binary(level + 1)?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr, ExpressionError> {
        match self.peek_op() {
            Some(op @ ("-" | "!")) => {
                self.pos += 1;
                Ok(Expr::Unary(op, Box::new(self.unary()?)))
            }
            _ => self.primary(),
        }
    }

    fn primary(&mut self) -> Result<Expr, ExpressionError> {
        let offset = self.offset();
        let Some((_, tok)) = self.tokens.get(self.pos).cloned() else {
            return Err(ExpressionError::Syntax {
                offset,
                reason: "unexpected end of expression".to_string(),
            });
        };
        self.pos += 1;
        match tok {
            Token::Num(n) => Ok(Expr::Lit(Value::Number(n))),
            Token::Str(s) => Ok(Expr::Lit(Value::Text(s))),
            Token::Ident(name) => Ok(match name.as_str() {
                "true" => Expr::Lit(Value::Bool(true)),
                "false" => Expr::Lit(Value::Bool(false)),
                _ => Expr::Var(name),
            }),
            Token::Op("(") => {
                let inner = self.ternary()?;
                self.expect(")")?;
                Ok(inner)
            }
            Token::Op(op) => Err(ExpressionError::Syntax {
                offset,
                reason: format!("unexpected '{op}'"),
            }),
        }
    }
}

fn number(v: &Value, op: &str) -> Result<f64, ExpressionError> {
    v.as_f64()
        .ok_or_else(|| ExpressionError::Type(format!("'{op}' needs a number, got {v:?}")))
}

fn boolean(v: &Value, op: &str) -> Result<bool, ExpressionError> {
    v.as_bool()
        .ok_or_else(|| ExpressionError::Type(format!("'{op}' needs a boolean, got {v:?}")))
}

fn eval(expr: &Expr, bindings: &Bindings) -> Result<Value, ExpressionError> {
    match expr {
        Expr::Lit(v) => Ok(v.clone()),
        Expr::Var(name) => bindings
            .get(name)
            .cloned()
            .ok_or_else(|| ExpressionError::UnknownVariable(name.clone())),
        Expr::Unary(op, inner) => {
            let v = eval(inner, bindings)?;
            match *op {
                "-" => Ok(Value::Number(-number(&v, op)?)),
                _ => Ok(Value::Bool(!boolean(&v, op)?)),
            }
        }
        Expr::Ternary(cond, then, otherwise) => {
            if boolean(&eval(cond, bindings)?, "?")? {
                eval(then, bindings)
            } else {
                eval(otherwise, bindings)
            }
        }
        Expr::Binary(op @ ("&&" | "||"), lhs, rhs) => {
            let l = boolean(&eval(lhs, bindings)?, op)?;
            if (*op == "&&" && !l) || (*op == "||" && l) {
                return Ok(Value::Bool(l));
            }
            Ok(Value::Bool(boolean(&eval(rhs, bindings)?, op)?))
        }
        Expr::Binary(op, lhs, rhs) => {
            let l = eval(lhs, bindings)?;
            let r = eval(rhs, bindings)?;
            binary(op, &l, &r)
        }
    }
}

fn binary(op: &str, l: &Value, r: &Value) -> Result<Value, ExpressionError> {
    match op {
        "==" => Ok(Value::Bool(l == r)),
        "!=" => Ok(Value::Bool(l != r)),
        "+" => match (l, r) {
            (Value::Text(_), _) | (_, Value::Text(_)) => Ok(Value::Text(format!("{l}{r}"))),
            _ => Ok(Value::Number(number(l, op)? + number(r, op)?)),
        },
        "<" | "<=" | ">" | ">=" => {
            let (a, b) = (number(l, op)?, number(r, op)?);
            Ok(Value::Bool(match op {
                "<" => a < b,
                "<=" => a <= b,
                ">" => a > b,
                _ => a >= b,
            }))
        }
        _ => {
            let (a, b) = (number(l, op)?, number(r, op)?);
            if (op == "/" || op == "%") && b == 0.0 {
                return Err(ExpressionError::Type("division by zero".to_string()));
            }
            Ok(Value::Number(match op {
                "-" => a - b,
                "*" => a * b,
                "/" => a / b,
                _ => a % b,
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval_with(expr: &str, vars: &[(&str, Value)]) -> Result<Value, ExpressionError> {
        let bindings: Bindings = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        SimpleExpressionService.evaluate(expr, &bindings)
    }

    #[test]
    fn arithmetic_respects_precedence() {
        let res = eval_with(
            "prevReading + inputDiff*3",
            &[("prevReading", 15.0.into()), ("inputDiff", 5.0.into())],
        );
        assert_eq!(res, Ok(Value::Number(30.0)));
        assert_eq!(eval_with("(1 + 2) * 3 - -1", &[]), Ok(Value::Number(10.0)));
        assert_eq!(eval_with("7 % 4 / 2", &[]), Ok(Value::Number(1.5)));
    }

    #[test]
    fn ternary_on_equality() {
        let expr = "currInput==15 ? prevReading : prevReading+(inputDiff*3)";
        let vars = |curr: f64| {
            vec![
                ("currInput", Value::Number(curr)),
                ("prevReading", Value::Number(15.0)),
                ("inputDiff", Value::Number(5.0)),
            ]
        };
        assert_eq!(eval_with(expr, &vars(15.0)), Ok(Value::Number(15.0)));
        assert_eq!(eval_with(expr, &vars(20.0)), Ok(Value::Number(30.0)));
    }

    #[test]
    fn boolean_operators_and_keywords() {
        let vars = [("watts", Value::Number(120.0)), ("mode", Value::from("auto"))];
        assert_eq!(eval_with("watts > 100 && mode == 'auto'", &vars), Ok(Value::Bool(true)));
        assert_eq!(eval_with("watts < 100 or not (mode != \"auto\")", &vars), Ok(Value::Bool(true)));
        assert_eq!(eval_with("!true", &[]), Ok(Value::Bool(false)));
        // short circuit skips the unknown variable
        assert_eq!(eval_with("false && missing > 1", &[]), Ok(Value::Bool(false)));
    }

    #[test]
    fn text_concatenation() {
        assert_eq!(
            eval_with("'a' + 1", &[]),
            Ok(Value::Text("a1".to_string()))
        );
    }

    #[test]
    fn errors_are_reported() {
        assert_eq!(
            eval_with("missing + 1", &[]),
            Err(ExpressionError::UnknownVariable("missing".into()))
        );
        assert!(matches!(eval_with("1 +", &[]), Err(ExpressionError::Syntax { .. })));
        assert!(matches!(eval_with("(1", &[]), Err(ExpressionError::Syntax { .. })));
        assert!(matches!(eval_with("1 2", &[]), Err(ExpressionError::Syntax { .. })));
        assert!(matches!(eval_with("'open", &[]), Err(ExpressionError::Syntax { .. })));
        assert!(matches!(eval_with("1 # 2", &[]), Err(ExpressionError::Syntax { .. })));
        assert!(matches!(eval_with("1 / 0", &[]), Err(ExpressionError::Type(_))));
        assert!(matches!(eval_with("1 && true", &[]), Err(ExpressionError::Type(_))));
        assert!(matches!(eval_with("1 ? 2 : 3", &[]), Err(ExpressionError::Type(_))));
    }

    #[test]
    fn compiled_expression_is_reusable() {
        let compiled = SimpleExpressionService.compile("watts * 2").unwrap();
        for w in [1.0, 2.5] {
            let bindings: Bindings = [("watts".to_string(), Value::Number(w))].into_iter().collect();
            assert_eq!(compiled.evaluate(&bindings), Ok(Value::Number(w * 2.0)));
        }
        // syntax is checked without any bindings; unknown names are not
        assert!(SimpleExpressionService.compile("watts >").is_err());
        assert!(SimpleExpressionService.compile("missing + 1").is_ok());
    }
}
