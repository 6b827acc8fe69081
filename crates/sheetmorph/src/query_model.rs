//! Syntax tree for query expressions.
//!
//! Produced by [`crate::query_parser`] and walked by [`crate::query_eval`]. The tree
//! only derives `PartialEq` so parsing the same text twice can be compared directly.

use std::rc::Rc;

use serde_json::Value as JsonValue;

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// String, number, boolean or null literal.
    Literal(JsonValue),
    /// Field lookup on the context item. Only appears as a path step.
    Name(String),
    /// `*`: every field value of the context object.
    Wildcard,
    /// `$`: the context item.
    Context,
    /// `$$`: the input document.
    Root,
    /// `$name`
    Variable(String),
    /// `/pattern/flags`; evaluates to a matcher function.
    Regex { pattern: String, flags: String },
    Path(PathExpr),
    /// `[a, b, 1..3]`
    Array(Vec<Expr>),
    /// `a..b`, only valid inside an array constructor.
    Range(Box<Expr>, Box<Expr>),
    /// `{key: value, ...}` evaluated against the context.
    Object(Vec<(Expr, Expr)>),
    /// `base{key: value, ...}`: group the items of `base` by key.
    Group {
        base: Box<Expr>,
        pairs: Vec<(Expr, Expr)>,
    },
    /// `base[predicate]` where `base` is not a path.
    Filter {
        base: Box<Expr>,
        predicate: Box<Expr>,
    },
    Negate(Box<Expr>),
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Condition {
        cond: Box<Expr>,
        then: Box<Expr>,
        otherwise: Option<Box<Expr>>,
    },
    /// `$name := value`
    Assign {
        name: String,
        value: Box<Expr>,
    },
    /// `(a; b; c)`
    Block(Vec<Expr>),
    /// `callee(args)`
    Call {
        callee: Box<Expr>,
        args: Vec<Expr>,
    },
    /// `function($a, $b) { body }`
    Lambda {
        params: Vec<String>,
        body: Rc<Expr>,
    },
    /// `lhs ~> rhs`
    Apply {
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct PathExpr {
    pub steps: Vec<Step>,
    /// Set by a trailing `[]`: a single result stays wrapped in an array.
    pub keep_array: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub expr: Expr,
    /// Predicates applied, in order, to the result of this step for each input item.
    pub predicates: Vec<Expr>,
}

impl Step {
    pub fn new(expr: Expr) -> Self {
        Self {
            expr,
            predicates: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    Concat,
    Eq,
    Ne,
    Lt,
    Lte,
    Gt,
    Gte,
    And,
    Or,
    In,
}

impl BinaryOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Subtract => "-",
            BinaryOp::Multiply => "*",
            BinaryOp::Divide => "/",
            BinaryOp::Modulo => "%",
            BinaryOp::Concat => "&",
            BinaryOp::Eq => "=",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Lte => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Gte => ">=",
            BinaryOp::And => "and",
            BinaryOp::Or => "or",
            BinaryOp::In => "in",
        }
    }
}

impl Expr {
    /// Wrap a single step into a path.
    pub fn path_of(step: Expr) -> Expr {
        Expr::Path(PathExpr {
            steps: vec![Step::new(step)],
            keep_array: false,
        })
    }

    pub fn is_array_constructor(&self) -> bool {
        matches!(self, Expr::Array(_))
    }
}

#[cfg(test)]
mod query_model_tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_path_of_wraps_single_step() {
        let expr = Expr::path_of(Expr::Name("people".to_string()));
        if let Expr::Path(path) = expr {
            assert_eq!(path.steps.len(), 1);
            assert!(path.steps[0].predicates.is_empty());
            assert!(!path.keep_array);
        } else {
            panic!("Expected Path expression");
        }
    }

    #[test]
    fn test_binary_op_symbols() {
        assert_eq!(BinaryOp::Concat.symbol(), "&");
        assert_eq!(BinaryOp::Ne.symbol(), "!=");
        assert_eq!(BinaryOp::In.symbol(), "in");
    }

    #[test]
    fn test_array_constructor_detection() {
        assert!(Expr::Array(vec![]).is_array_constructor());
        assert!(!Expr::Literal(json!([1, 2])).is_array_constructor());
    }
}
