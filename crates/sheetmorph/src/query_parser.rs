//! Pratt parser for query expressions.
//!
//! The grammar follows JSONata: `.` builds paths, `[...]` attaches predicates to the
//! step on its left, `{...}` after an expression groups it, and `$f(...)`, `~>`,
//! `:=`, `? :` and lambdas are supported. Binding powers:
//!
//! | operator                         | power |
//! |----------------------------------|-------|
//! | `[` `(`                          | 80    |
//! | `.`                              | 75    |
//! | `{` (group)                      | 70    |
//! | `*` `/` `%`                      | 60    |
//! | `+` `-` `&`                      | 50    |
//! | `=` `!=` `<` `<=` `>` `>=` `in` `~>` | 40 |
//! | `and`                            | 30    |
//! | `or`                             | 25    |
//! | `? :`                            | 20    |
//! | `:=`                             | 10    |

use std::rc::Rc;

use serde_json::Value as JsonValue;

use crate::error::{ConvertError, ExprLocation};
use crate::model::number_to_json;
use crate::query_lexer::{Token, TokenKind, tokenize};
use crate::query_model::{BinaryOp, Expr, PathExpr, Step};

/// Nesting depth allowed while parsing before giving up.
pub const DEFAULT_MAX_NESTING: usize = 256;

const UNARY_MINUS_BP: u8 = 70;

pub fn parse_expression(source: &str) -> Result<Expr, ConvertError> {
    parse_expression_with_limit(source, DEFAULT_MAX_NESTING)
}

pub fn parse_expression_with_limit(source: &str, max_nesting: usize) -> Result<Expr, ConvertError> {
    let tokens = tokenize(source)?;
    let mut parser = Parser {
        source,
        tokens,
        pos: 0,
        depth: 0,
        max_nesting,
    };
    let expr = parser.expression(0)?;
    let trailing = parser.peek();
    if trailing.kind != TokenKind::Eof {
        return Err(parser.error_at(
            trailing.offset,
            format!("unexpected {} after end of expression", trailing.kind.describe()),
        ));
    }
    Ok(expr)
}

struct Parser<'a> {
    source: &'a str,
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
    max_nesting: usize,
}

impl<'a> Parser<'a> {
    fn error_at(&self, offset: usize, message: impl Into<String>) -> ConvertError {
        ConvertError::syntax(message).with_location(ExprLocation::from_offset(self.source, offset))
    }

    fn peek(&self) -> &Token {
        // the token list always ends with Eof and the parser never moves past it
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if token.kind != TokenKind::Eof {
            self.pos += 1;
        }
        token
    }

    fn at(&self, kind: &TokenKind) -> bool {
        &self.peek().kind == kind
    }

    fn expect(&mut self, kind: TokenKind) -> Result<Token, ConvertError> {
        let token = self.advance();
        if token.kind == kind {
            Ok(token)
        } else {
            Err(self.error_at(
                token.offset,
                format!("expected {} but found {}", kind.describe(), token.kind.describe()),
            ))
        }
    }

    fn expression(&mut self, rbp: u8) -> Result<Expr, ConvertError> {
        self.depth += 1;
        if self.depth > self.max_nesting {
            let offset = self.peek().offset;
            return Err(self.error_at(offset, "expression is nested too deeply"));
        }

        let token = self.advance();
        let mut left = self.prefix(token)?;
        while rbp < left_binding_power(&self.peek().kind) {
            let token = self.advance();
            left = self.infix(token, left)?;
        }

        self.depth -= 1;
        Ok(left)
    }

    fn prefix(&mut self, token: Token) -> Result<Expr, ConvertError> {
        match token.kind {
            TokenKind::Number(n) => Ok(Expr::Literal(number_to_json(n).unwrap_or(JsonValue::Null))),
            TokenKind::Str(s) => Ok(Expr::Literal(JsonValue::String(s))),
            TokenKind::Regex { pattern, flags } => Ok(Expr::Regex { pattern, flags }),
            TokenKind::True => Ok(Expr::Literal(JsonValue::Bool(true))),
            TokenKind::False => Ok(Expr::Literal(JsonValue::Bool(false))),
            TokenKind::Null => Ok(Expr::Literal(JsonValue::Null)),
            TokenKind::Name(name) => {
                if (name == "function" || name == "λ") && self.at(&TokenKind::LParen) {
                    return self.lambda();
                }
                Ok(Expr::path_of(Expr::Name(name)))
            }
            TokenKind::Variable(name) => Ok(match name.as_str() {
                "" => Expr::Context,
                "$" => Expr::Root,
                _ => Expr::Variable(name),
            }),
            TokenKind::Star => Ok(Expr::path_of(Expr::Wildcard)),
            TokenKind::Minus => {
                let operand = self.expression(UNARY_MINUS_BP)?;
                if let Expr::Literal(JsonValue::Number(n)) = &operand {
                    if let Some(value) = n.as_f64().and_then(|f| number_to_json(-f)) {
                        return Ok(Expr::Literal(value));
                    }
                }
                Ok(Expr::Negate(Box::new(operand)))
            }
            TokenKind::LParen => self.block(),
            TokenKind::LBracket => self.array_constructor(),
            TokenKind::LBrace => Ok(Expr::Object(self.object_pairs()?)),
            other => Err(self.error_at(token.offset, format!("unexpected {}", other.describe()))),
        }
    }

    fn infix(&mut self, token: Token, left: Expr) -> Result<Expr, ConvertError> {
        let bp = left_binding_power(&token.kind);
        match token.kind {
            TokenKind::Dot => {
                let rhs = self.expression(bp)?;
                Ok(join_path(left, rhs))
            }
            TokenKind::LBracket => {
                if self.at(&TokenKind::RBracket) {
                    self.advance();
                    return Ok(keep_array(left));
                }
                let predicate = self.expression(0)?;
                self.expect(TokenKind::RBracket)?;
                Ok(attach_predicate(left, predicate))
            }
            TokenKind::LParen => {
                let args = self.call_args()?;
                Ok(Expr::Call {
                    callee: Box::new(left),
                    args,
                })
            }
            TokenKind::LBrace => {
                let pairs = self.object_pairs()?;
                Ok(Expr::Group {
                    base: Box::new(left),
                    pairs,
                })
            }
            TokenKind::Question => {
                let then = self.expression(0)?;
                let otherwise = if self.at(&TokenKind::Colon) {
                    self.advance();
                    Some(Box::new(self.expression(0)?))
                } else {
                    None
                };
                Ok(Expr::Condition {
                    cond: Box::new(left),
                    then: Box::new(then),
                    otherwise,
                })
            }
            TokenKind::Assign => {
                let name = match left {
                    Expr::Variable(name) => name,
                    _ => {
                        return Err(self.error_at(
                            token.offset,
                            "left side of ':=' must be a variable name",
                        ));
                    }
                };
                let value = self.expression(bp - 1)?;
                Ok(Expr::Assign {
                    name,
                    value: Box::new(value),
                })
            }
            TokenKind::Chain => {
                let rhs = self.expression(bp)?;
                Ok(Expr::Apply {
                    lhs: Box::new(left),
                    rhs: Box::new(rhs),
                })
            }
            ref kind => {
                let op = match binary_op(kind) {
                    Some(op) => op,
                    None => {
                        return Err(self.error_at(
                            token.offset,
                            format!("unexpected {}", kind.describe()),
                        ));
                    }
                };
                let rhs = self.expression(bp)?;
                Ok(Expr::Binary {
                    op,
                    lhs: Box::new(left),
                    rhs: Box::new(rhs),
                })
            }
        }
    }

    fn block(&mut self) -> Result<Expr, ConvertError> {
        let mut statements = Vec::new();
        while !self.at(&TokenKind::RParen) {
            statements.push(self.expression(0)?);
            if !self.at(&TokenKind::Semicolon) {
                break;
            }
            self.advance();
        }
        self.expect(TokenKind::RParen)?;
        Ok(Expr::Block(statements))
    }

    fn array_constructor(&mut self) -> Result<Expr, ConvertError> {
        let mut items = Vec::new();
        while !self.at(&TokenKind::RBracket) {
            let item = self.expression(0)?;
            if self.at(&TokenKind::DotDot) {
                self.advance();
                let end = self.expression(0)?;
                items.push(Expr::Range(Box::new(item), Box::new(end)));
            } else {
                items.push(item);
            }
            if !self.at(&TokenKind::Comma) {
                break;
            }
            self.advance();
        }
        self.expect(TokenKind::RBracket)?;
        Ok(Expr::Array(items))
    }

    /// Parses `key: value, ...}` after the opening brace.
    fn object_pairs(&mut self) -> Result<Vec<(Expr, Expr)>, ConvertError> {
        let mut pairs = Vec::new();
        while !self.at(&TokenKind::RBrace) {
            let key = self.expression(0)?;
            self.expect(TokenKind::Colon)?;
            let value = self.expression(0)?;
            pairs.push((key, value));
            if !self.at(&TokenKind::Comma) {
                break;
            }
            self.advance();
        }
        self.expect(TokenKind::RBrace)?;
        Ok(pairs)
    }

    fn call_args(&mut self) -> Result<Vec<Expr>, ConvertError> {
        let mut args = Vec::new();
        while !self.at(&TokenKind::RParen) {
            args.push(self.expression(0)?);
            if !self.at(&TokenKind::Comma) {
                break;
            }
            self.advance();
        }
        self.expect(TokenKind::RParen)?;
        Ok(args)
    }

    fn lambda(&mut self) -> Result<Expr, ConvertError> {
        self.expect(TokenKind::LParen)?;
        let mut params = Vec::new();
        while !self.at(&TokenKind::RParen) {
            let token = self.advance();
            match token.kind {
                TokenKind::Variable(name) if !name.is_empty() && name != "$" => {
                    if params.contains(&name) {
                        return Err(self.error_at(
                            token.offset,
                            format!("duplicate parameter ${}", name),
                        ));
                    }
                    params.push(name);
                }
                other => {
                    return Err(self.error_at(
                        token.offset,
                        format!("expected parameter variable but found {}", other.describe()),
                    ));
                }
            }
            if !self.at(&TokenKind::Comma) {
                break;
            }
            self.advance();
        }
        self.expect(TokenKind::RParen)?;
        if self.at(&TokenKind::Lt) {
            self.skip_signature()?;
        }
        self.expect(TokenKind::LBrace)?;
        let body = self.expression(0)?;
        self.expect(TokenKind::RBrace)?;
        Ok(Expr::Lambda {
            params,
            body: Rc::new(body),
        })
    }

    /// Type signatures such as `<n-n:n>` are accepted and ignored.
    fn skip_signature(&mut self) -> Result<(), ConvertError> {
        let start = self.advance();
        let mut depth = 1usize;
        while depth > 0 {
            let token = self.advance();
            match token.kind {
                TokenKind::Lt => depth += 1,
                TokenKind::Gt => depth -= 1,
                TokenKind::Eof => {
                    return Err(self.error_at(start.offset, "function signature is not closed"));
                }
                _ => {}
            }
        }
        Ok(())
    }
}

fn left_binding_power(kind: &TokenKind) -> u8 {
    match kind {
        TokenKind::LBracket | TokenKind::LParen => 80,
        TokenKind::Dot => 75,
        TokenKind::LBrace => 70,
        TokenKind::Star | TokenKind::Slash | TokenKind::Percent => 60,
        TokenKind::Plus | TokenKind::Minus | TokenKind::Amp => 50,
        TokenKind::Eq
        | TokenKind::Ne
        | TokenKind::Lt
        | TokenKind::Lte
        | TokenKind::Gt
        | TokenKind::Gte
        | TokenKind::Chain => 40,
        TokenKind::Name(name) => match name.as_str() {
            "in" => 40,
            "and" => 30,
            "or" => 25,
            _ => 0,
        },
        TokenKind::Question => 20,
        TokenKind::Assign => 10,
        _ => 0,
    }
}

fn binary_op(kind: &TokenKind) -> Option<BinaryOp> {
    let op = match kind {
        TokenKind::Plus => BinaryOp::Add,
        TokenKind::Minus => BinaryOp::Subtract,
        TokenKind::Star => BinaryOp::Multiply,
        TokenKind::Slash => BinaryOp::Divide,
        TokenKind::Percent => BinaryOp::Modulo,
        TokenKind::Amp => BinaryOp::Concat,
        TokenKind::Eq => BinaryOp::Eq,
        TokenKind::Ne => BinaryOp::Ne,
        TokenKind::Lt => BinaryOp::Lt,
        TokenKind::Lte => BinaryOp::Lte,
        TokenKind::Gt => BinaryOp::Gt,
        TokenKind::Gte => BinaryOp::Gte,
        TokenKind::Name(name) => match name.as_str() {
            "and" => BinaryOp::And,
            "or" => BinaryOp::Or,
            "in" => BinaryOp::In,
            _ => return None,
        },
        _ => return None,
    };
    Some(op)
}

fn into_path(expr: Expr) -> PathExpr {
    match expr {
        Expr::Path(path) => path,
        other => PathExpr {
            steps: vec![Step::new(other)],
            keep_array: false,
        },
    }
}

fn join_path(left: Expr, rhs: Expr) -> Expr {
    let mut path = into_path(left);
    match rhs {
        Expr::Path(rhs_path) => {
            path.steps.extend(rhs_path.steps);
            path.keep_array |= rhs_path.keep_array;
        }
        other => path.steps.push(Step::new(other)),
    }
    Expr::Path(path)
}

fn keep_array(left: Expr) -> Expr {
    let mut path = into_path(left);
    path.keep_array = true;
    Expr::Path(path)
}

fn attach_predicate(left: Expr, predicate: Expr) -> Expr {
    match left {
        Expr::Path(mut path) => {
            if let Some(last) = path.steps.last_mut() {
                last.predicates.push(predicate);
            }
            Expr::Path(path)
        }
        other => Expr::Filter {
            base: Box::new(other),
            predicate: Box::new(predicate),
        },
    }
}

#[cfg(test)]
mod query_parser_tests {
    use super::*;
    use serde_json::json;

    fn name(n: &str) -> Expr {
        Expr::Name(n.to_string())
    }

    fn path(steps: Vec<Step>) -> Expr {
        Expr::Path(PathExpr {
            steps,
            keep_array: false,
        })
    }

    #[test]
    fn test_parse_simple_path() {
        let expr = parse_expression("people.name").unwrap();
        assert_eq!(expr, path(vec![Step::new(name("people")), Step::new(name("name"))]));
    }

    #[test]
    fn test_parse_is_repeatable() {
        let source = "property[LOINC_code = 100].{ 'code': LOINC_code, 'display': LOINC_display }";
        assert_eq!(parse_expression(source).unwrap(), parse_expression(source).unwrap());
    }

    #[test]
    fn test_predicate_attaches_to_step() {
        let expr = parse_expression("people[age > 20].name").unwrap();
        if let Expr::Path(p) = expr {
            assert_eq!(p.steps.len(), 2);
            assert_eq!(p.steps[0].predicates.len(), 1);
            assert!(p.steps[1].predicates.is_empty());
        } else {
            panic!("Expected Path expression");
        }
    }

    #[test]
    fn test_predicate_on_inner_step() {
        let expr = parse_expression("a.b[0]").unwrap();
        if let Expr::Path(p) = expr {
            assert!(p.steps[0].predicates.is_empty());
            assert_eq!(p.steps[1].predicates, vec![Expr::Literal(json!(0))]);
        } else {
            panic!("Expected Path expression");
        }
    }

    #[test]
    fn test_predicate_on_block_is_filter() {
        let expr = parse_expression("(a.b)[0]").unwrap();
        assert!(matches!(expr, Expr::Filter { .. }));
    }

    #[test]
    fn test_keep_array_marker() {
        let expr = parse_expression("people.name[]").unwrap();
        if let Expr::Path(p) = expr {
            assert!(p.keep_array);
        } else {
            panic!("Expected Path expression");
        }
    }

    #[test]
    fn test_precedence() {
        let expr = parse_expression("1 + 2 * 3").unwrap();
        assert_eq!(
            expr,
            Expr::Binary {
                op: BinaryOp::Add,
                lhs: Box::new(Expr::Literal(json!(1))),
                rhs: Box::new(Expr::Binary {
                    op: BinaryOp::Multiply,
                    lhs: Box::new(Expr::Literal(json!(2))),
                    rhs: Box::new(Expr::Literal(json!(3))),
                }),
            }
        );
    }

    #[test]
    fn test_and_or_keywords() {
        let expr = parse_expression("a = 1 or b = 2 and c").unwrap();
        if let Expr::Binary { op, rhs, .. } = expr {
            assert_eq!(op, BinaryOp::Or);
            assert!(matches!(*rhs, Expr::Binary { op: BinaryOp::And, .. }));
        } else {
            panic!("Expected Binary expression");
        }
    }

    #[test]
    fn test_negative_literal_folds() {
        assert_eq!(parse_expression("-5").unwrap(), Expr::Literal(json!(-5)));
        assert!(matches!(parse_expression("-a").unwrap(), Expr::Negate(_)));
    }

    #[test]
    fn test_object_constructor_as_step() {
        let expr = parse_expression("unit.{'code': UCUM_code}").unwrap();
        if let Expr::Path(p) = expr {
            assert!(matches!(p.steps[1].expr, Expr::Object(_)));
        } else {
            panic!("Expected Path expression");
        }
    }

    #[test]
    fn test_group_by() {
        let expr = parse_expression("unit{UCUM_code: unit}").unwrap();
        assert!(matches!(expr, Expr::Group { .. }));
    }

    #[test]
    fn test_array_with_range() {
        let expr = parse_expression("[1..3, 'x']").unwrap();
        if let Expr::Array(items) = expr {
            assert!(matches!(items[0], Expr::Range(_, _)));
            assert_eq!(items[1], Expr::Literal(json!("x")));
        } else {
            panic!("Expected Array expression");
        }
    }

    #[test]
    fn test_block_with_assignment() {
        let expr = parse_expression("($x := 2; $x * 3)").unwrap();
        if let Expr::Block(statements) = expr {
            assert_eq!(statements.len(), 2);
            assert!(matches!(statements[0], Expr::Assign { .. }));
        } else {
            panic!("Expected Block expression");
        }
    }

    #[test]
    fn test_lambda_with_signature() {
        let expr = parse_expression("function($v)<n:n>{ $v * 2 }").unwrap();
        if let Expr::Lambda { params, .. } = expr {
            assert_eq!(params, vec!["v".to_string()]);
        } else {
            panic!("Expected Lambda expression");
        }
    }

    #[test]
    fn test_function_call_in_path() {
        let expr = parse_expression("people.$uppercase(name)").unwrap();
        if let Expr::Path(p) = expr {
            assert!(matches!(p.steps[1].expr, Expr::Call { .. }));
        } else {
            panic!("Expected Path expression");
        }
    }

    #[test]
    fn test_regex_argument() {
        let expr = parse_expression("$replace(code, /[-_]+/i, '.')").unwrap();
        if let Expr::Call { args, .. } = expr {
            assert_eq!(
                args[1],
                Expr::Regex {
                    pattern: "[-_]+".to_string(),
                    flags: "i".to_string(),
                }
            );
        } else {
            panic!("Expected Call expression");
        }
        let expr = parse_expression("total / 2").unwrap();
        assert!(matches!(expr, Expr::Binary { op: BinaryOp::Divide, .. }));
    }

    #[test]
    fn test_chain_operator() {
        let expr = parse_expression("name ~> $uppercase()").unwrap();
        assert!(matches!(expr, Expr::Apply { .. }));
    }

    #[test]
    fn test_conditional() {
        let expr = parse_expression("a > 1 ? 'big' : 'small'").unwrap();
        if let Expr::Condition { otherwise, .. } = expr {
            assert!(otherwise.is_some());
        } else {
            panic!("Expected Condition expression");
        }
    }

    #[test]
    fn test_syntax_errors() {
        for source in ["people.", "(a", "[1, 2", "{'a' 1}", "a b", "1 := 2", "", "a ]"] {
            let err = parse_expression(source).unwrap_err();
            assert!(err.is_syntax(), "{source}: {err}");
            assert!(err.location.is_some(), "{source}: missing location");
        }
    }

    #[test]
    fn test_error_location_points_at_token() {
        let err = parse_expression("a.b +\n  )").unwrap_err();
        let location = err.location.unwrap();
        assert_eq!((location.line, location.column), (2, 3));
    }

    #[test]
    fn test_nesting_limit() {
        let source = format!("{}1{}", "(".repeat(50), ")".repeat(50));
        assert!(parse_expression_with_limit(&source, 20).is_err());
        assert!(parse_expression_with_limit(&source, 100).is_ok());
    }
}
