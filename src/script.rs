//! Stream module language.
//!
//! A module is a list of functions; each function is a pipeline applied to
//! the records selected by a query:
//!
//! ```text
//! -- comment
//! function check_password(candidate)
//!     map rec.password == candidate
//! end
//! ```
//!
//! Stages are `filter <expr>`, `map <expr>` and `count`. Expressions read bins
//! through `rec.<bin>`, refer to parameters by name and combine values with
//! `== != < <= > >= and or not`. The grammar lives in `script.pest`.

use pest::error::{Error as PestError, LineColLocation};
use pest::iterators::Pair;
use pest::Parser;
use std::cmp::Ordering;
use std::collections::HashMap;
use thiserror::Error;

use crate::models::{Record, Value};

mod grammar {
    use pest_derive::Parser;

    #[derive(Parser)]
    #[grammar = "script.pest"] // relative to src
    pub struct ModuleParser;
}

use grammar::{ModuleParser, Rule};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("line {line}: {message}")]
pub struct ScriptError {
    pub line: usize,
    pub message: String,
}

impl ScriptError {
    fn new(line: usize, message: impl Into<String>) -> Self {
        Self {
            line,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(Value),
    Bin(String),
    Param(usize),
    Not(Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
enum Stage {
    Filter(Expr),
    Map(Expr),
    Count,
}

/// A compiled stream function.
#[derive(Debug, Clone)]
pub struct Function {
    name: String,
    params: Vec<String>,
    stages: Vec<Stage>,
}

/// A compiled module: its functions by name.
#[derive(Debug, Clone)]
pub struct Module {
    name: String,
    functions: HashMap<String, Function>,
}

impl Module {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn function(&self, name: &str) -> Option<&Function> {
        self.functions.get(name)
    }

    pub fn function_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.functions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

enum Item {
    Record(Record),
    Value(Value),
}

impl Function {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn arity(&self) -> usize {
        self.params.len()
    }

    /// Run the pipeline over a record stream. Argument count is the caller's
    /// responsibility.
    pub fn apply<I>(&self, records: I, args: &[Value]) -> Result<Vec<Value>, String>
    where
        I: IntoIterator<Item = Record>,
    {
        if self.stages.is_empty() {
            return Ok(Vec::new());
        }

        let mut items: Vec<Item> = records.into_iter().map(Item::Record).collect();
        for stage in &self.stages {
            items = match stage {
                Stage::Filter(expr) => {
                    let mut kept = Vec::with_capacity(items.len());
                    for item in items {
                        match eval(expr, &item, args)? {
                            Value::Bool(true) => kept.push(item),
                            Value::Bool(false) | Value::Nil => {}
                            other => {
                                return Err(format!("filter expects bool, got {}", other.type_name()))
                            }
                        }
                    }
                    kept
                }
                Stage::Map(expr) => items
                    .iter()
                    .map(|item| eval(expr, item, args).map(Item::Value))
                    .collect::<Result<_, _>>()?,
                Stage::Count => vec![Item::Value(Value::Int(items.len() as i64))],
            };
        }

        items
            .into_iter()
            .map(|item| match item {
                Item::Value(v) => Ok(v),
                Item::Record(_) => Err(format!("function {} produced records, not values", self.name)),
            })
            .collect()
    }
}

fn eval(expr: &Expr, item: &Item, args: &[Value]) -> Result<Value, String> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Bin(name) => match item {
            Item::Record(rec) => Ok(rec.get(name).cloned().unwrap_or_default()),
            Item::Value(_) => Err(format!("rec.{name} read from a mapped value")),
        },
        Expr::Param(i) => args
            .get(*i)
            .cloned()
            .ok_or_else(|| format!("missing argument {}", i + 1)),
        Expr::Not(inner) => match eval(inner, item, args)? {
            Value::Bool(b) => Ok(Value::Bool(!b)),
            other => Err(format!("not expects bool, got {}", other.type_name())),
        },
        Expr::Binary(op @ (BinOp::And | BinOp::Or), lhs, rhs) => {
            let left = expect_bool(eval(lhs, item, args)?, *op)?;
            match (op, left) {
                (BinOp::And, false) => Ok(Value::Bool(false)),
                (BinOp::Or, true) => Ok(Value::Bool(true)),
                _ => Ok(Value::Bool(expect_bool(eval(rhs, item, args)?, *op)?)),
            }
        }
        Expr::Binary(op, lhs, rhs) => {
            let left = eval(lhs, item, args)?;
            let right = eval(rhs, item, args)?;
            let result = match op {
                BinOp::Eq => left == right,
                BinOp::Ne => left != right,
                _ => {
                    let ord = compare(&left, &right)?;
                    match op {
                        BinOp::Lt => ord == Ordering::Less,
                        BinOp::Le => ord != Ordering::Greater,
                        BinOp::Gt => ord == Ordering::Greater,
                        _ => ord != Ordering::Less,
                    }
                }
            };
            Ok(Value::Bool(result))
        }
    }
}

fn expect_bool(value: Value, op: BinOp) -> Result<bool, String> {
    match value {
        Value::Bool(b) => Ok(b),
        other => Err(format!("{op:?} expects bool operands, got {}", other.type_name())),
    }
}

fn compare(left: &Value, right: &Value) -> Result<Ordering, String> {
    match (left, right) {
        (Value::Int(a), Value::Int(b)) => Ok(a.cmp(b)),
        (Value::Str(a), Value::Str(b)) => Ok(a.cmp(b)),
        _ => Err(format!(
            "cannot order {} against {}",
            left.type_name(),
            right.type_name()
        )),
    }
}

// --- Module walk ---

fn syntax_error(err: PestError<Rule>) -> ScriptError {
    let line = match err.line_col {
        LineColLocation::Pos((line, _)) | LineColLocation::Span((line, _), _) => line,
    };
    let err = err.renamed_rules(describe);
    ScriptError::new(line, err.variant.message())
}

fn describe(rule: &Rule) -> String {
    let name = match rule {
        Rule::EOI => "end of input",
        Rule::ident => "name",
        Rule::bin_name => "bin name",
        Rule::cmp_op => "comparison operator",
        Rule::or_expr | Rule::and_expr | Rule::not_expr | Rule::comparison => "expression",
        Rule::header | Rule::kw_function => "function",
        Rule::end | Rule::kw_end => "end",
        Rule::filter | Rule::kw_filter => "filter",
        Rule::map | Rule::kw_map => "map",
        Rule::count | Rule::kw_count => "count",
        Rule::kw_or => "or",
        Rule::kw_and => "and",
        Rule::kw_not => "not",
        Rule::kw_rec | Rule::bin => "rec.<bin>",
        other => return format!("{other:?}"),
    };
    name.to_string()
}

fn line_of(pair: &Pair<'_, Rule>) -> usize {
    pair.as_span().start_pos().line_col().0
}

fn is_keyword(rule: Rule) -> bool {
    matches!(
        rule,
        Rule::kw_function
            | Rule::kw_end
            | Rule::kw_filter
            | Rule::kw_map
            | Rule::kw_count
            | Rule::kw_rec
            | Rule::kw_or
            | Rule::kw_and
            | Rule::kw_not
    )
}

/// Inner pairs without the keywords that introduced them.
fn operands(pair: Pair<'_, Rule>) -> impl Iterator<Item = Pair<'_, Rule>> {
    pair.into_inner().filter(|inner| !is_keyword(inner.as_rule()))
}

fn single(pair: Pair<'_, Rule>) -> Result<Pair<'_, Rule>, ScriptError> {
    let line = line_of(&pair);
    operands(pair)
        .next()
        .ok_or_else(|| ScriptError::new(line, "expected expression"))
}

fn comparison_op(text: &str) -> Option<BinOp> {
    match text {
        "==" => Some(BinOp::Eq),
        "!=" => Some(BinOp::Ne),
        "<" => Some(BinOp::Lt),
        "<=" => Some(BinOp::Le),
        ">" => Some(BinOp::Gt),
        ">=" => Some(BinOp::Ge),
        _ => None,
    }
}

fn unescape(quoted: &str) -> String {
    let body = quoted.get(1..quoted.len().saturating_sub(1)).unwrap_or_default();
    let mut out = String::with_capacity(body.len());
    let mut chars = body.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some(other) => out.push(other),
            None => {}
        }
    }
    out
}

/// Names an expression may refer to.
struct Scope<'a> {
    params: &'a [String],
    records_available: bool,
}

impl Scope<'_> {
    fn build(&self, pair: Pair<'_, Rule>) -> Result<Expr, ScriptError> {
        let line = line_of(&pair);
        match pair.as_rule() {
            rule @ (Rule::or_expr | Rule::and_expr) => {
                let op = if rule == Rule::or_expr { BinOp::Or } else { BinOp::And };
                let mut expr: Option<Expr> = None;
                for term in operands(pair) {
                    let rhs = self.build(term)?;
                    expr = Some(match expr {
                        None => rhs,
                        Some(lhs) => Expr::Binary(op, Box::new(lhs), Box::new(rhs)),
                    });
                }
                expr.ok_or_else(|| ScriptError::new(line, "expected expression"))
            }
            Rule::not_expr => {
                let inner = single(pair)?;
                if inner.as_rule() == Rule::not_expr {
                    Ok(Expr::Not(Box::new(self.build(inner)?)))
                } else {
                    self.build(inner)
                }
            }
            Rule::comparison => {
                let mut parts = operands(pair);
                let lhs = match parts.next() {
                    Some(lhs) => self.build(lhs)?,
                    None => return Err(ScriptError::new(line, "expected expression")),
                };
                match (parts.next(), parts.next()) {
                    (Some(op), Some(rhs)) => {
                        let op = comparison_op(op.as_str()).ok_or_else(|| {
                            ScriptError::new(line, format!("unknown operator {:?}", op.as_str()))
                        })?;
                        Ok(Expr::Binary(op, Box::new(lhs), Box::new(self.build(rhs)?)))
                    }
                    _ => Ok(lhs),
                }
            }
            Rule::nil => Ok(Expr::Literal(Value::Nil)),
            Rule::boolean => Ok(Expr::Literal(Value::Bool(pair.as_str() == "true"))),
            Rule::int => pair
                .as_str()
                .parse::<i64>()
                .map(|v| Expr::Literal(Value::Int(v)))
                .map_err(|_| ScriptError::new(line, format!("invalid integer {:?}", pair.as_str()))),
            Rule::string => Ok(Expr::Literal(Value::Str(unescape(pair.as_str())))),
            Rule::bin => {
                if !self.records_available {
                    return Err(ScriptError::new(line, "rec is not available after map or count"));
                }
                Ok(Expr::Bin(single(pair)?.as_str().to_string()))
            }
            Rule::ident => {
                let name = pair.as_str();
                self.params
                    .iter()
                    .position(|p| p == name)
                    .map(Expr::Param)
                    .ok_or_else(|| ScriptError::new(line, format!("unknown name {name:?}")))
            }
            other => Err(ScriptError::new(line, format!("unexpected {}", describe(&other)))),
        }
    }
}

struct PendingFunction {
    line: usize,
    function: Function,
    records_available: bool,
}

fn header(pair: Pair<'_, Rule>) -> Result<(String, Vec<String>), ScriptError> {
    let line = line_of(&pair);
    let mut name = None;
    let mut params: Vec<String> = Vec::new();
    for part in operands(pair) {
        match part.as_rule() {
            Rule::ident => name = Some(part.as_str().to_string()),
            Rule::params => {
                for param in part.into_inner() {
                    let param = param.as_str().to_string();
                    if params.contains(&param) {
                        return Err(ScriptError::new(line, format!("duplicate parameter {param:?}")));
                    }
                    params.push(param);
                }
            }
            _ => {}
        }
    }
    let name = name.ok_or_else(|| ScriptError::new(line, "expected function name"))?;
    Ok((name, params))
}

/// Compile module source.
pub fn parse_module(name: &str, source: &str) -> Result<Module, ScriptError> {
    let pairs = ModuleParser::parse(Rule::module, source).map_err(syntax_error)?;
    let mut functions: HashMap<String, Function> = HashMap::new();
    let mut current: Option<PendingFunction> = None;

    for statement in pairs.flat_map(|module| module.into_inner()) {
        let line = line_of(&statement);
        match statement.as_rule() {
            Rule::header => {
                if let Some(open) = &current {
                    return Err(ScriptError::new(
                        line,
                        format!("function {} is not closed with end", open.function.name),
                    ));
                }
                let (fname, params) = header(statement)?;
                current = Some(PendingFunction {
                    line,
                    function: Function {
                        name: fname,
                        params,
                        stages: Vec::new(),
                    },
                    records_available: true,
                });
            }
            Rule::end => {
                let pending = current
                    .take()
                    .ok_or_else(|| ScriptError::new(line, "end without function"))?;
                if matches!(pending.function.stages.last(), Some(Stage::Filter(_))) {
                    return Err(ScriptError::new(
                        line,
                        format!("function {} must end with map or count", pending.function.name),
                    ));
                }
                if functions.contains_key(&pending.function.name) {
                    return Err(ScriptError::new(
                        pending.line,
                        format!("function {} defined twice", pending.function.name),
                    ));
                }
                functions.insert(pending.function.name.clone(), pending.function);
            }
            rule @ (Rule::filter | Rule::map | Rule::count) => {
                let pending = current.as_mut().ok_or_else(|| {
                    ScriptError::new(line, format!("{} outside function", describe(&rule)))
                })?;
                let stage = if rule == Rule::count {
                    Stage::Count
                } else {
                    let scope = Scope {
                        params: &pending.function.params,
                        records_available: pending.records_available,
                    };
                    let expr = scope.build(single(statement)?)?;
                    if rule == Rule::filter {
                        Stage::Filter(expr)
                    } else {
                        Stage::Map(expr)
                    }
                };
                if !matches!(stage, Stage::Filter(_)) {
                    pending.records_available = false;
                }
                pending.function.stages.push(stage);
            }
            _ => {}
        }
    }

    if let Some(open) = current {
        return Err(ScriptError::new(
            open.line,
            format!("function {} is missing end", open.function.name),
        ));
    }
    if functions.is_empty() {
        return Err(ScriptError::new(0, "module defines no functions"));
    }
    Ok(Module {
        name: name.to_string(),
        functions,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Bin;
    use chrono::Utc;

    const PROFILE: &str = r#"
-- profile checks
function check_password(candidate)
    map rec.password == candidate
end

function count_named(name)
    filter rec.username == name or rec.username == "admin"
    count
end
"#;

    fn profile(username: &str, password: &str) -> Record {
        Record {
            bins: vec![Bin::new("username", username), Bin::new("password", password)],
            generation: 1,
            last_update: Utc::now(),
        }
    }

    #[test]
    fn test_check_password_yields_pass_fail() {
        let module = parse_module("profile", PROFILE).expect("compile");
        assert_eq!(module.function_names(), vec!["check_password", "count_named"]);
        let check = module.function("check_password").unwrap();
        assert_eq!(check.arity(), 1);

        let out = check
            .apply(vec![profile("Mary", "ghjks")], &[Value::from("ghjks")])
            .unwrap();
        assert_eq!(out, vec![Value::Bool(true)]);

        let out = check
            .apply(vec![profile("Mary", "ghjks")], &[Value::from("wrong")])
            .unwrap();
        assert_eq!(out, vec![Value::Bool(false)]);

        assert!(check.apply(Vec::new(), &[Value::from("ghjks")]).unwrap().is_empty());
    }

    #[test]
    fn test_filter_and_count() {
        let module = parse_module("profile", PROFILE).expect("compile");
        let count = module.function("count_named").unwrap();
        let records = vec![profile("Mary", "a"), profile("Bill", "b"), profile("admin", "c")];
        let out = count.apply(records, &[Value::from("Mary")]).unwrap();
        assert_eq!(out, vec![Value::Int(2)]);
    }

    #[test]
    fn test_comparison_rules() {
        let source = "function f(n)\n map rec.age >= n and not (rec.name == nil)\nend\n";
        let module = parse_module("m", source).unwrap();
        let f = module.function("f").unwrap();
        let rec = Record {
            bins: vec![Bin::new("age", 30i64), Bin::new("name", "x")],
            generation: 1,
            last_update: Utc::now(),
        };
        assert_eq!(f.apply(vec![rec.clone()], &[Value::Int(18)]).unwrap(), vec![Value::Bool(true)]);

        let err = f.apply(vec![rec], &[Value::from("18")]).unwrap_err();
        assert!(err.contains("cannot order"), "{err}");
    }

    #[test]
    fn test_compile_errors_carry_line_numbers() {
        let cases = [
            ("function f(\nend\n", 1),
            ("function f()\n map rec.x ==\nend\n", 2),
            ("function f()\n filter rec.x == 1\nend\n", 3),
            ("function f()\n map unknown\nend\n", 2),
            ("function f()\n count\n map rec.x\nend\n", 3),
            ("\n\nfunction f()\n count\n", 3),
            ("map rec.x\n", 1),
            ("function f()\n map 'open\nend\n", 2),
        ];
        for (source, line) in cases {
            let err = parse_module("m", source).unwrap_err();
            assert_eq!(err.line, line, "{source:?}: {err}");
        }
        assert!(parse_module("m", "-- nothing here\n").is_err());
    }

    #[test]
    fn test_syntax_errors_name_what_was_expected() {
        let err = parse_module("m", "-- header\n\nfunction f(a,)\n count\nend\n").unwrap_err();
        assert_eq!(err.line, 3);
        assert!(err.message.contains("name"), "{err}");
        assert!(err.to_string().starts_with("line 3: "), "{err}");

        // Keywords cannot name functions or parameters.
        assert_eq!(parse_module("m", "function map()\n count\nend\n").unwrap_err().line, 1);
        assert_eq!(parse_module("m", "\nfunction f(rec)\n count\nend\n").unwrap_err().line, 2);
        assert_eq!(parse_module("m", "function f()\n count extra\nend\n").unwrap_err().line, 2);

        let err = parse_module("m", "function f(a, a)\n count\nend\n").unwrap_err();
        assert!(err.message.contains("duplicate parameter"), "{err}");
        let err = parse_module("m", "function f()\n count\nend\nfunction f()\n count\nend\n").unwrap_err();
        assert_eq!((err.line, err.message.as_str()), (4, "function f defined twice"));
    }

    #[test]
    fn test_literals_and_precedence() {
        let source = "function f()\r\n  map not rec.a == 'x\\'y' or rec.count < -3 and true -- trailing\r\nend";
        let module = parse_module("m", source).unwrap();
        let f = module.function("f").unwrap();
        let rec = |a: &str, count: i64| Record {
            bins: vec![Bin::new("a", a), Bin::new("count", count)],
            generation: 1,
            last_update: Utc::now(),
        };
        // (not (a == "x'y")) or ((count < -3) and true)
        let out = f
            .apply(vec![rec("x'y", 0), rec("x'y", -4), rec("z", 0)], &[])
            .unwrap();
        assert_eq!(out, vec![Value::Bool(false), Value::Bool(true), Value::Bool(true)]);

        let module = parse_module("m", "function g()\n map \"tab\\there\"\nend\n").unwrap();
        let out = module.function("g").unwrap().apply(vec![rec("", 0)], &[]).unwrap();
        assert_eq!(out, vec![Value::from("tab\there")]);
    }

    #[test]
    fn test_empty_function_yields_nothing() {
        let module = parse_module("m", "function noop()\nend\n").unwrap();
        let out = module
            .function("noop")
            .unwrap()
            .apply(vec![profile("Mary", "ghjks")], &[])
            .unwrap();
        assert!(out.is_empty());
    }
}
