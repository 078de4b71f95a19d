//! Expression engine for constraint checks, guards and messages
//!
//! Expressions are loaded from RON scripts and evaluated against one model
//! element at a time. Evaluation is pure: it never mutates the model, which is
//! what allows any thread or worker process to evaluate any job redundantly.

use crate::{Element, Error, KindId, Model, ModelRepository, Result, Value, ValueMap};
use serde::{Deserialize, Serialize};

/// An expression that can be evaluated to produce a Value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    // === Literals ===
    /// A literal value
    Literal(Value),

    // === Property Access ===
    /// Read a property from the target element
    Property(String),
    /// Follow the element reference stored in the first property and read the
    /// second property from the referenced element (same model)
    Follow(String, String),
    /// Read a script variable
    Variable(String),
    /// The target element itself, as an element reference
    SelfRef,
    /// The target element's kind, as a string
    KindOf,

    // === Arithmetic ===
    /// Add two expressions
    Add(Box<Expr>, Box<Expr>),
    /// Subtract second from first
    Sub(Box<Expr>, Box<Expr>),
    /// Multiply two expressions
    Mul(Box<Expr>, Box<Expr>),
    /// Divide first by second
    Div(Box<Expr>, Box<Expr>),
    /// Modulo
    Mod(Box<Expr>, Box<Expr>),
    /// Negate a numeric value
    Neg(Box<Expr>),
    /// Absolute value
    Abs(Box<Expr>),
    /// Minimum of two values
    Min(Box<Expr>, Box<Expr>),
    /// Maximum of two values
    Max(Box<Expr>, Box<Expr>),

    // === Comparison ===
    /// Equal
    Eq(Box<Expr>, Box<Expr>),
    /// Not equal
    Ne(Box<Expr>, Box<Expr>),
    /// Less than
    Lt(Box<Expr>, Box<Expr>),
    /// Less than or equal
    Le(Box<Expr>, Box<Expr>),
    /// Greater than
    Gt(Box<Expr>, Box<Expr>),
    /// Greater than or equal
    Ge(Box<Expr>, Box<Expr>),

    // === Logical ===
    /// Logical AND (all must be true)
    And(Vec<Expr>),
    /// Logical OR (at least one must be true)
    Or(Vec<Expr>),
    /// Logical NOT
    Not(Box<Expr>),
    /// Logical implication
    Implies(Box<Expr>, Box<Expr>),

    // === Conditionals ===
    /// If-then-else
    If(Box<Expr>, Box<Expr>, Box<Expr>),

    // === Model Queries ===
    /// Check if the target element has a non-null property
    HasProperty(String),
    /// Check if the target element is of a kind
    IsKind(KindId),
    /// Count elements of a kind across the repository
    CountOfKind(KindId),
    /// Length of a string or list
    Len(Box<Expr>),
    /// Check if a list holds a value, or a string holds a substring
    Contains(Box<Expr>, Box<Expr>),

    // === Constraint Dependencies ===
    /// True when every named constraint is satisfied by the target element
    ///
    /// Names are either local (`"HasName"`) or qualified with the context
    /// name (`"Person.HasName"`). Each name is also a scheduling dependency.
    Satisfies(Vec<String>),

    // === String ===
    /// Concatenate strings
    Concat(Vec<Expr>),
    /// Format a string with values (`{0}`, `{1}`, ...)
    Format(String, Vec<Expr>),
}

/// Answers `Satisfies` queries for the element being checked
///
/// Implemented by the execution engine, which evaluates (and caches) the
/// referenced constraints against the same element.
pub trait ConstraintOracle {
    /// Whether the named constraint is satisfied by the current element
    fn satisfies(&self, constraint: &str) -> Result<bool>;
}

/// Context for evaluating expressions
pub struct EvalContext<'a> {
    /// The target element (if any)
    pub target: Option<&'a Element>,
    /// The model owning the target element
    pub model: Option<&'a Model>,
    /// Every model visible to the run
    pub repository: &'a ModelRepository,
    /// Script variables and parameter bindings
    pub variables: &'a ValueMap,
    /// Resolver for `Satisfies`
    pub oracle: Option<&'a dyn ConstraintOracle>,
}

impl<'a> EvalContext<'a> {
    /// Create a new evaluation context with no target
    pub fn new(repository: &'a ModelRepository, variables: &'a ValueMap) -> Self {
        Self {
            target: None,
            model: None,
            repository,
            variables,
            oracle: None,
        }
    }

    /// Set the target element and the model it belongs to
    pub fn with_target(mut self, model: &'a Model, target: &'a Element) -> Self {
        self.model = Some(model);
        self.target = Some(target);
        self
    }

    /// Set the constraint oracle
    pub fn with_oracle(mut self, oracle: &'a dyn ConstraintOracle) -> Self {
        self.oracle = Some(oracle);
        self
    }

    fn target(&self, what: &str) -> Result<&'a Element> {
        self.target
            .ok_or_else(|| Error::EvaluationError(format!("No target element for {}", what)))
    }
}

impl Expr {
    /// Evaluate this expression in the given context
    pub fn eval(&self, ctx: &EvalContext) -> Result<Value> {
        match self {
            // Literals
            Expr::Literal(v) => Ok(v.clone()),

            // Property access
            Expr::Property(name) => {
                let element = ctx.target("Property access")?;
                Ok(element.get(name).cloned().unwrap_or(Value::Null))
            }
            Expr::Follow(reference, name) => {
                let element = ctx.target("Follow")?;
                let target = match element.get(reference) {
                    Some(Value::ElementRef(id)) => *id,
                    Some(Value::Null) | None => return Ok(Value::Null),
                    Some(other) => {
                        return Err(Error::TypeError {
                            expected: "element".to_string(),
                            got: other.type_name().to_string(),
                        })
                    }
                };
                let model = ctx.model.ok_or_else(|| {
                    Error::EvaluationError("No model bound for Follow".to_string())
                })?;
                let referenced = model
                    .elements
                    .get(target)
                    .ok_or_else(|| Error::ElementNotFound(model.reference(target).to_string()))?;
                Ok(referenced.get(name).cloned().unwrap_or(Value::Null))
            }
            Expr::Variable(name) => Ok(ctx.variables.get(name).cloned().unwrap_or(Value::Null)),
            Expr::SelfRef => Ok(Value::ElementRef(ctx.target("SelfRef")?.id)),
            Expr::KindOf => Ok(Value::String(ctx.target("KindOf")?.kind.to_string())),

            // Arithmetic
            Expr::Add(a, b) => numeric_op(
                &a.eval(ctx)?,
                &b.eval(ctx)?,
                i64::checked_add,
                |x, y| x + y,
            ),
            Expr::Sub(a, b) => numeric_op(
                &a.eval(ctx)?,
                &b.eval(ctx)?,
                i64::checked_sub,
                |x, y| x - y,
            ),
            Expr::Mul(a, b) => numeric_op(
                &a.eval(ctx)?,
                &b.eval(ctx)?,
                i64::checked_mul,
                |x, y| x * y,
            ),
            Expr::Div(a, b) => divide(&a.eval(ctx)?, &b.eval(ctx)?),
            Expr::Mod(a, b) => {
                let va = a.eval(ctx)?;
                let vb = b.eval(ctx)?;
                if as_number(&vb)? == 0.0 {
                    return Err(Error::DivisionByZero);
                }
                numeric_op(&va, &vb, i64::checked_rem, |x, y| x % y)
            }
            Expr::Neg(a) => match a.eval(ctx)? {
                Value::Int(x) => x
                    .checked_neg()
                    .map(Value::Int)
                    .ok_or_else(|| overflow(format!("-{}", x))),
                other => Ok(Value::Float(-as_number(&other)?)),
            },
            Expr::Abs(a) => match a.eval(ctx)? {
                Value::Int(x) => x
                    .checked_abs()
                    .map(Value::Int)
                    .ok_or_else(|| overflow(format!("abs({})", x))),
                other => Ok(Value::Float(as_number(&other)?.abs())),
            },
            Expr::Min(a, b) => numeric_op(
                &a.eval(ctx)?,
                &b.eval(ctx)?,
                |x, y| Some(x.min(y)),
                f64::min,
            ),
            Expr::Max(a, b) => numeric_op(
                &a.eval(ctx)?,
                &b.eval(ctx)?,
                |x, y| Some(x.max(y)),
                f64::max,
            ),

            // Comparison
            Expr::Eq(a, b) => Ok(Value::Bool(values_equal(&a.eval(ctx)?, &b.eval(ctx)?))),
            Expr::Ne(a, b) => Ok(Value::Bool(!values_equal(&a.eval(ctx)?, &b.eval(ctx)?))),
            Expr::Lt(a, b) => compare_values(&a.eval(ctx)?, &b.eval(ctx)?, |x, y| x < y),
            Expr::Le(a, b) => compare_values(&a.eval(ctx)?, &b.eval(ctx)?, |x, y| x <= y),
            Expr::Gt(a, b) => compare_values(&a.eval(ctx)?, &b.eval(ctx)?, |x, y| x > y),
            Expr::Ge(a, b) => compare_values(&a.eval(ctx)?, &b.eval(ctx)?, |x, y| x >= y),

            // Logical
            Expr::And(exprs) => {
                for expr in exprs {
                    if !expr.eval(ctx)?.is_truthy() {
                        return Ok(Value::Bool(false));
                    }
                }
                Ok(Value::Bool(true))
            }
            Expr::Or(exprs) => {
                for expr in exprs {
                    if expr.eval(ctx)?.is_truthy() {
                        return Ok(Value::Bool(true));
                    }
                }
                Ok(Value::Bool(false))
            }
            Expr::Not(a) => Ok(Value::Bool(!a.eval(ctx)?.is_truthy())),
            Expr::Implies(a, b) => {
                if a.eval(ctx)?.is_truthy() {
                    Ok(Value::Bool(b.eval(ctx)?.is_truthy()))
                } else {
                    Ok(Value::Bool(true))
                }
            }

            // Conditionals
            Expr::If(cond, then_expr, else_expr) => {
                if cond.eval(ctx)?.is_truthy() {
                    then_expr.eval(ctx)
                } else {
                    else_expr.eval(ctx)
                }
            }

            // Model queries
            Expr::HasProperty(name) => {
                let element = ctx.target("HasProperty")?;
                Ok(Value::Bool(
                    element.get(name).map(|v| !v.is_null()).unwrap_or(false),
                ))
            }
            Expr::IsKind(kind) => Ok(Value::Bool(&ctx.target("IsKind")?.kind == kind)),
            Expr::CountOfKind(kind) => Ok(Value::Int(ctx.repository.count_of_kind(kind) as i64)),
            Expr::Len(a) => match a.eval(ctx)? {
                Value::String(s) => Ok(Value::Int(s.chars().count() as i64)),
                Value::List(list) => Ok(Value::Int(list.len() as i64)),
                Value::Map(map) => Ok(Value::Int(map.len() as i64)),
                Value::Null => Ok(Value::Int(0)),
                other => Err(Error::TypeError {
                    expected: "string or list".to_string(),
                    got: other.type_name().to_string(),
                }),
            },
            Expr::Contains(haystack, needle) => {
                let needle = needle.eval(ctx)?;
                match haystack.eval(ctx)? {
                    Value::List(list) => Ok(Value::Bool(
                        list.iter().any(|item| values_equal(item, &needle)),
                    )),
                    Value::String(s) => {
                        let sub = needle.as_str().ok_or_else(|| Error::TypeError {
                            expected: "string".to_string(),
                            got: needle.type_name().to_string(),
                        })?;
                        Ok(Value::Bool(s.contains(sub)))
                    }
                    other => Err(Error::TypeError {
                        expected: "string or list".to_string(),
                        got: other.type_name().to_string(),
                    }),
                }
            }

            // Constraint dependencies
            Expr::Satisfies(names) => {
                let oracle = ctx.oracle.ok_or_else(|| {
                    Error::EvaluationError("Satisfies requires a constraint oracle".to_string())
                })?;
                for name in names {
                    if !oracle.satisfies(name)? {
                        return Ok(Value::Bool(false));
                    }
                }
                Ok(Value::Bool(true))
            }

            // String
            Expr::Concat(exprs) => {
                let mut result = String::new();
                for expr in exprs {
                    result.push_str(&expr.eval(ctx)?.to_string());
                }
                Ok(Value::String(result))
            }
            Expr::Format(template, args) => {
                let mut result = template.clone();
                for (i, expr) in args.iter().enumerate() {
                    let v = expr.eval(ctx)?;
                    let placeholder = format!("{{{}}}", i);
                    result = result.replace(&placeholder, &v.to_string());
                }
                Ok(Value::String(result))
            }
        }
    }

    /// Direct child expressions
    pub fn children(&self) -> Vec<&Expr> {
        match self {
            Expr::Literal(_)
            | Expr::Property(_)
            | Expr::Follow(_, _)
            | Expr::Variable(_)
            | Expr::SelfRef
            | Expr::KindOf
            | Expr::HasProperty(_)
            | Expr::IsKind(_)
            | Expr::CountOfKind(_)
            | Expr::Satisfies(_) => Vec::new(),
            Expr::Neg(a) | Expr::Abs(a) | Expr::Not(a) | Expr::Len(a) => vec![a.as_ref()],
            Expr::Add(a, b)
            | Expr::Sub(a, b)
            | Expr::Mul(a, b)
            | Expr::Div(a, b)
            | Expr::Mod(a, b)
            | Expr::Min(a, b)
            | Expr::Max(a, b)
            | Expr::Eq(a, b)
            | Expr::Ne(a, b)
            | Expr::Lt(a, b)
            | Expr::Le(a, b)
            | Expr::Gt(a, b)
            | Expr::Ge(a, b)
            | Expr::Implies(a, b)
            | Expr::Contains(a, b) => vec![a.as_ref(), b.as_ref()],
            Expr::If(a, b, c) => vec![a.as_ref(), b.as_ref(), c.as_ref()],
            Expr::And(exprs) | Expr::Or(exprs) | Expr::Concat(exprs) | Expr::Format(_, exprs) => {
                exprs.iter().collect()
            }
        }
    }

    /// Every constraint name referenced through `Satisfies`, in first-seen order
    pub fn referenced_constraints(&self) -> Vec<&str> {
        let mut names = Vec::new();
        let mut stack = vec![self];
        while let Some(expr) = stack.pop() {
            if let Expr::Satisfies(refs) = expr {
                for name in refs {
                    if !names.contains(&name.as_str()) {
                        names.push(name.as_str());
                    }
                }
            }
            // Reverse so the left-most child is visited first
            stack.extend(expr.children().into_iter().rev());
        }
        names
    }

    /// Create a literal expression
    pub fn lit(value: impl Into<Value>) -> Self {
        Expr::Literal(value.into())
    }

    /// Create a property access expression
    pub fn prop(name: impl Into<String>) -> Self {
        Expr::Property(name.into())
    }

    /// Create a variable access expression
    pub fn var(name: impl Into<String>) -> Self {
        Expr::Variable(name.into())
    }

    /// Create a `Satisfies` expression over one constraint
    pub fn satisfies(name: impl Into<String>) -> Self {
        Expr::Satisfies(vec![name.into()])
    }
}

fn as_number(v: &Value) -> Result<f64> {
    v.as_number().ok_or_else(|| Error::TypeError {
        expected: "number".to_string(),
        got: v.type_name().to_string(),
    })
}

/// Helper to perform numeric operations
///
/// Two integers use checked `i64` arithmetic and fail on overflow; anything
/// involving a float yields a float.
fn numeric_op(
    a: &Value,
    b: &Value,
    int: fn(i64, i64) -> Option<i64>,
    float: fn(f64, f64) -> f64,
) -> Result<Value> {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => int(*x, *y)
            .map(Value::Int)
            .ok_or_else(|| overflow(format!("{} and {}", x, y))),
        _ => Ok(Value::Float(float(as_number(a)?, as_number(b)?))),
    }
}

/// Integer division stays integral only when it is exact
fn divide(a: &Value, b: &Value) -> Result<Value> {
    if as_number(b)? == 0.0 {
        return Err(Error::DivisionByZero);
    }
    match (a, b) {
        (Value::Int(x), Value::Int(y)) if matches!(x.checked_rem(*y), Some(r) if r != 0) => {
            Ok(Value::Float(*x as f64 / *y as f64))
        }
        _ => numeric_op(a, b, i64::checked_div, |x, y| x / y),
    }
}

fn overflow(operands: String) -> Error {
    Error::EvaluationError(format!("integer overflow on {}", operands))
}

/// Helper to compare values
fn compare_values(a: &Value, b: &Value, cmp: fn(f64, f64) -> bool) -> Result<Value> {
    Ok(Value::Bool(cmp(as_number(a)?, as_number(b)?)))
}

/// Check if two values are equal
fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Int(x), Value::Int(y)) => x == y,
        (Value::Float(x), Value::Float(y)) => (x - y).abs() < f64::EPSILON,
        (Value::Int(x), Value::Float(y)) | (Value::Float(y), Value::Int(x)) => {
            (*x as f64 - y).abs() < f64::EPSILON
        }
        (Value::String(x), Value::String(y)) => x == y,
        (Value::ElementRef(x), Value::ElementRef(y)) => x == y,
        (Value::List(x), Value::List(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(a, b)| values_equal(a, b))
        }
        _ => false,
    }
}
