//! Deterministic builtins: unification, comparison, arithmetic, type checks,
//! term construction, lists, atoms, and `aggregate_all/3`.
//!
//! Control constructs, `findall`, `between`, and database updates are handled
//! by the machine itself; they are listed here so user programs cannot
//! redefine them.

use std::cmp::Ordering;

use crate::term::{parse_term, Term};

use super::machine::{Bindings, Machine};
use super::InterpreterError;

const BUILTINS: &[(&str, usize)] = &[
    // handled by the machine
    ("findall", 3),
    ("findall", 4),
    ("forall", 2),
    ("once", 1),
    ("ignore", 1),
    ("not", 1),
    ("between", 3),
    ("assert", 1),
    ("asserta", 1),
    ("assertz", 1),
    ("retract", 1),
    ("retractall", 1),
    // handled below
    ("=", 2),
    ("\\=", 2),
    ("==", 2),
    ("\\==", 2),
    ("@<", 2),
    ("@>", 2),
    ("@=<", 2),
    ("@>=", 2),
    ("compare", 3),
    ("is", 2),
    ("=:=", 2),
    ("=\\=", 2),
    ("<", 2),
    (">", 2),
    ("=<", 2),
    (">=", 2),
    ("var", 1),
    ("nonvar", 1),
    ("atom", 1),
    ("number", 1),
    ("integer", 1),
    ("float", 1),
    ("atomic", 1),
    ("compound", 1),
    ("callable", 1),
    ("is_list", 1),
    ("ground", 1),
    ("string", 1),
    ("functor", 3),
    ("arg", 3),
    ("=..", 2),
    ("copy_term", 2),
    ("term_variables", 2),
    ("length", 2),
    ("msort", 2),
    ("sort", 2),
    ("keysort", 2),
    ("list_to_set", 2),
    ("sum_list", 2),
    ("max_list", 2),
    ("min_list", 2),
    ("numlist", 3),
    ("atom_length", 2),
    ("atom_concat", 3),
    ("atom_chars", 2),
    ("atom_number", 2),
    ("atomic_list_concat", 2),
    ("atomic_list_concat", 3),
    ("term_to_atom", 2),
    ("succ", 2),
    ("aggregate_all", 3),
];

pub(crate) fn is_builtin(name: &str, arity: usize) -> bool {
    (name == "call" && (1..=8).contains(&arity))
        || BUILTINS.iter().any(|(n, a)| *n == name && *a == arity)
}

/// Runs a builtin. `None` means `name/arity` is not one.
pub(crate) fn call(
    m: &mut Machine<'_>,
    name: &str,
    args: &[Term],
) -> Option<Result<bool, InterpreterError>> {
    if name == "aggregate_all" && args.len() == 3 {
        return Some(aggregate_all(m, args));
    }
    let b = &mut m.bindings;
    let result = match (name, args.len()) {
        ("=", 2) => Ok(b.unify(&args[0], &args[1])),
        ("\\=", 2) => {
            let mark = b.mark();
            let unified = b.unify(&args[0], &args[1]);
            b.restore(mark);
            Ok(!unified)
        }
        ("==", 2) => Ok(standard_order(b, args) == Ordering::Equal),
        ("\\==", 2) => Ok(standard_order(b, args) != Ordering::Equal),
        ("@<", 2) => Ok(standard_order(b, args) == Ordering::Less),
        ("@>", 2) => Ok(standard_order(b, args) == Ordering::Greater),
        ("@=<", 2) => Ok(standard_order(b, args) != Ordering::Greater),
        ("@>=", 2) => Ok(standard_order(b, args) != Ordering::Less),
        ("compare", 3) => {
            let symbol = match standard_order(b, &args[1..]) {
                Ordering::Less => "<",
                Ordering::Equal => "=",
                Ordering::Greater => ">",
            };
            Ok(b.unify(&args[0], &Term::atom(symbol)))
        }
        ("is", 2) => eval(b, &args[1]).map(|v| {
            let value = v.to_term();
            b.unify(&args[0], &value)
        }),
        ("=:=", 2) => arith_compare(b, args, |o| o == Ordering::Equal),
        ("=\\=", 2) => arith_compare(b, args, |o| o != Ordering::Equal),
        ("<", 2) => arith_compare(b, args, |o| o == Ordering::Less),
        (">", 2) => arith_compare(b, args, |o| o == Ordering::Greater),
        ("=<", 2) => arith_compare(b, args, |o| o != Ordering::Greater),
        (">=", 2) => arith_compare(b, args, |o| o != Ordering::Less),
        ("var", 1) => Ok(b.deref(&args[0]).is_var()),
        ("nonvar", 1) => Ok(!b.deref(&args[0]).is_var()),
        ("atom", 1) => Ok(matches!(b.deref(&args[0]), Term::Atom(_))),
        ("number", 1) => Ok(b.deref(&args[0]).is_number()),
        ("integer", 1) => Ok(matches!(b.deref(&args[0]), Term::Int(_))),
        ("float", 1) => Ok(matches!(b.deref(&args[0]), Term::Float(_))),
        ("atomic", 1) => Ok(matches!(
            b.deref(&args[0]),
            Term::Atom(_) | Term::Int(_) | Term::Float(_) | Term::Str(_)
        )),
        ("compound", 1) => Ok(matches!(b.deref(&args[0]), Term::Compound(..))),
        ("callable", 1) => Ok(b.deref(&args[0]).is_callable()),
        ("is_list", 1) => Ok(b.resolve(&args[0]).list_items().is_some()),
        ("ground", 1) => Ok(b.resolve(&args[0]).is_ground()),
        ("string", 1) => Ok(matches!(b.deref(&args[0]), Term::Str(_))),
        ("functor", 3) => functor(b, args),
        ("arg", 3) => arg(b, args),
        ("=..", 2) => univ(b, args),
        ("copy_term", 2) => {
            let resolved = b.resolve(&args[0]);
            let copy = b.copy_fresh(&resolved);
            Ok(b.unify(&args[1], &copy))
        }
        ("term_variables", 2) => {
            let vars = b
                .resolve(&args[0])
                .variables()
                .into_iter()
                .map(Term::Var)
                .collect();
            Ok(b.unify(&args[1], &Term::list(vars)))
        }
        ("length", 2) => length(b, args),
        ("msort", 2) => sort_list(b, args, false),
        ("sort", 2) => sort_list(b, args, true),
        ("keysort", 2) => keysort(b, args),
        ("list_to_set", 2) => list_items(b, &args[0], "list_to_set/2").map(|items| {
            let mut set: Vec<Term> = Vec::with_capacity(items.len());
            for item in items {
                if !set.iter().any(|s| compare_terms(s, &item) == Ordering::Equal) {
                    set.push(item);
                }
            }
            b.unify(&args[1], &Term::list(set))
        }),
        ("sum_list", 2) => list_numbers(b, &args[0], "sum_list/2").and_then(|nums| {
            let total = nums
                .into_iter()
                .try_fold(Num::Int(0), |acc, n| arith2("+", acc, n))?;
            Ok(b.unify(&args[1], &total.to_term()))
        }),
        ("max_list", 2) => extreme_number(b, args, Ordering::Greater),
        ("min_list", 2) => extreme_number(b, args, Ordering::Less),
        ("numlist", 3) => {
            let low = int_arg(b, &args[0], "numlist/3");
            let high = int_arg(b, &args[1], "numlist/3");
            match (low, high) {
                (Ok(low), Ok(high)) => {
                    let items = (low..=high).map(Term::Int).collect();
                    Ok(b.unify(&args[2], &Term::list(items)))
                }
                (Err(e), _) | (_, Err(e)) => Err(e),
            }
        }
        ("atom_length", 2) => text_arg(b, &args[0], "atom_length/2").and_then(|text| {
            let len = i64::try_from(text.chars().count()).unwrap_or(i64::MAX);
            Ok(b.unify(&args[1], &Term::Int(len)))
        }),
        ("atom_concat", 3) => atom_concat(b, args),
        ("atom_chars", 2) => atom_chars(b, args),
        ("atom_number", 2) => atom_number(b, args),
        ("atomic_list_concat", 2) => list_items(b, &args[0], "atomic_list_concat/2")
            .and_then(|items| join_texts(b, &items, ""))
            .map(|joined| b.unify(&args[1], &Term::Atom(joined))),
        ("atomic_list_concat", 3) => atomic_list_concat_sep(b, args),
        ("term_to_atom", 2) => term_to_atom(b, args),
        ("succ", 2) => succ(b, args),
        _ => return None,
    };
    Some(result)
}

/// Reads an integer argument.
pub(crate) fn int_arg(b: &Bindings, term: &Term, context: &str) -> Result<i64, InterpreterError> {
    match b.deref(term) {
        Term::Int(v) => Ok(*v),
        Term::Var(_) => Err(instantiation(context)),
        other => Err(type_error("integer", other)),
    }
}

fn instantiation(context: &str) -> InterpreterError {
    InterpreterError::Instantiation {
        context: context.to_string(),
    }
}

fn type_error(expected: &str, culprit: &Term) -> InterpreterError {
    InterpreterError::Type {
        expected: expected.to_string(),
        culprit: culprit.to_canonical(),
    }
}

fn evaluation(message: impl Into<String>) -> InterpreterError {
    InterpreterError::Evaluation {
        message: message.into(),
    }
}

// ---------------------------------------------------------------------------
// Standard order
// ---------------------------------------------------------------------------

fn standard_order(b: &Bindings, args: &[Term]) -> Ordering {
    compare_terms(&b.resolve(&args[0]), &b.resolve(&args[1]))
}

fn type_rank(term: &Term) -> u8 {
    match term {
        Term::Var(_) => 0,
        Term::Float(_) | Term::Int(_) => 1,
        Term::Atom(_) => 3,
        Term::Str(_) => 4,
        Term::Compound(..) => 5,
    }
}

/// Standard order of terms: variables, numbers, atoms, strings, compounds.
/// Numbers compare by value; an integer sorts after an equal float.
pub(crate) fn compare_terms(a: &Term, b: &Term) -> Ordering {
    let mut pending = vec![(a, b)];
    while let Some((a, b)) = pending.pop() {
        let order = match (a, b) {
            (Term::Var(x), Term::Var(y)) => x.cmp(y),
            (Term::Int(x), Term::Int(y)) => x.cmp(y),
            (Term::Float(_) | Term::Int(_), Term::Float(_) | Term::Int(_)) => {
                let (x, y) = (a.as_f64().unwrap_or(0.0), b.as_f64().unwrap_or(0.0));
                x.total_cmp(&y)
                    .then_with(|| u8::from(matches!(a, Term::Int(_))).cmp(&u8::from(matches!(b, Term::Int(_)))))
            }
            (Term::Atom(x), Term::Atom(y)) | (Term::Str(x), Term::Str(y)) => x.cmp(y),
            (Term::Compound(f, xs), Term::Compound(g, ys)) => {
                let order = xs.len().cmp(&ys.len()).then_with(|| f.cmp(g));
                if order == Ordering::Equal {
                    pending.extend(xs.iter().zip(ys).rev());
                }
                order
            }
            _ => type_rank(a).cmp(&type_rank(b)),
        };
        if order != Ordering::Equal {
            return order;
        }
    }
    Ordering::Equal
}

// ---------------------------------------------------------------------------
// Arithmetic
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
enum Num {
    Int(i64),
    Float(f64),
}

impl Num {
    fn to_term(self) -> Term {
        match self {
            Self::Int(v) => Term::Int(v),
            Self::Float(v) => Term::Float(v),
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn as_f64(self) -> f64 {
        match self {
            Self::Int(v) => v as f64,
            Self::Float(v) => v,
        }
    }

    fn compare(self, other: Self) -> Option<Ordering> {
        match (self, other) {
            (Self::Int(x), Self::Int(y)) => Some(x.cmp(&y)),
            _ => self.as_f64().partial_cmp(&other.as_f64()),
        }
    }
}

fn eval(b: &Bindings, term: &Term) -> Result<Num, InterpreterError> {
    match b.deref(term) {
        Term::Int(v) => Ok(Num::Int(*v)),
        Term::Float(v) => Ok(Num::Float(*v)),
        Term::Var(_) => Err(instantiation("arithmetic")),
        Term::Atom(name) => match name.as_str() {
            "pi" => Ok(Num::Float(std::f64::consts::PI)),
            "e" => Ok(Num::Float(std::f64::consts::E)),
            "inf" | "infinite" => Ok(Num::Float(f64::INFINITY)),
            "nan" => Ok(Num::Float(f64::NAN)),
            "max_tagged_integer" => Ok(Num::Int(i64::MAX)),
            _ => Err(type_error("evaluable", &Term::Atom(format!("{name}/0")))),
        },
        Term::Compound(op, args) if args.len() == 1 => arith1(op, eval(b, &args[0])?),
        Term::Compound(op, args) if args.len() == 2 => {
            let x = eval(b, &args[0])?;
            let y = eval(b, &args[1])?;
            arith2(op, x, y)
        }
        Term::Compound(op, args) => Err(type_error(
            "evaluable",
            &Term::Atom(format!("{op}/{}", args.len())),
        )),
        other @ Term::Str(_) => Err(type_error("evaluable", other)),
    }
}

fn overflow() -> InterpreterError {
    evaluation("integer overflow")
}

#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
fn float_to_int(v: f64) -> Result<Num, InterpreterError> {
    if v.is_finite() && v >= i64::MIN as f64 && v <= i64::MAX as f64 {
        Ok(Num::Int(v as i64))
    } else {
        Err(evaluation(format!("cannot convert {v} to integer")))
    }
}

fn arith1(op: &str, x: Num) -> Result<Num, InterpreterError> {
    let f = x.as_f64();
    match (op, x) {
        ("-", Num::Int(v)) => v.checked_neg().map(Num::Int).ok_or_else(overflow),
        ("-", Num::Float(v)) => Ok(Num::Float(-v)),
        ("+", _) => Ok(x),
        ("abs", Num::Int(v)) => v.checked_abs().map(Num::Int).ok_or_else(overflow),
        ("abs", Num::Float(v)) => Ok(Num::Float(v.abs())),
        ("sign", Num::Int(v)) => Ok(Num::Int(v.signum())),
        ("sign", Num::Float(v)) => Ok(Num::Float(if v == 0.0 { 0.0 } else { v.signum() })),
        ("float", _) => Ok(Num::Float(f)),
        ("integer", Num::Int(_)) | ("truncate" | "round" | "ceiling" | "floor", Num::Int(_)) => Ok(x),
        ("integer" | "round", Num::Float(v)) => float_to_int(v.round()),
        ("truncate", Num::Float(v)) => float_to_int(v.trunc()),
        ("ceiling", Num::Float(v)) => float_to_int(v.ceil()),
        ("floor", Num::Float(v)) => float_to_int(v.floor()),
        ("float_integer_part", _) => Ok(Num::Float(f.trunc())),
        ("float_fractional_part", _) => Ok(Num::Float(f.fract())),
        ("sqrt", _) if f < 0.0 => Err(evaluation("undefined: sqrt of a negative number")),
        ("sqrt", _) => Ok(Num::Float(f.sqrt())),
        ("sin", _) => Ok(Num::Float(f.sin())),
        ("cos", _) => Ok(Num::Float(f.cos())),
        ("tan", _) => Ok(Num::Float(f.tan())),
        ("atan", _) => Ok(Num::Float(f.atan())),
        ("exp", _) => Ok(Num::Float(f.exp())),
        ("log", _) if f <= 0.0 => Err(evaluation("undefined: log of a non-positive number")),
        ("log", _) => Ok(Num::Float(f.ln())),
        ("log2", _) if f <= 0.0 => Err(evaluation("undefined: log2 of a non-positive number")),
        ("log2", _) => Ok(Num::Float(f.log2())),
        ("\\", Num::Int(v)) => Ok(Num::Int(!v)),
        _ => Err(type_error("evaluable", &Term::Atom(format!("{op}/1")))),
    }
}

fn int_pair(op: &str, x: Num, y: Num) -> Result<(i64, i64), InterpreterError> {
    match (x, y) {
        (Num::Int(a), Num::Int(b)) => Ok((a, b)),
        (Num::Float(v), _) | (_, Num::Float(v)) => Err(InterpreterError::Type {
            expected: "integer".to_string(),
            culprit: format!("{v} in {op}/2"),
        }),
    }
}

fn arith2(op: &str, x: Num, y: Num) -> Result<Num, InterpreterError> {
    let both_int = matches!((x, y), (Num::Int(_), Num::Int(_)));
    match op {
        "+" | "-" | "*" if both_int => {
            let (a, b) = int_pair(op, x, y)?;
            let r = match op {
                "+" => a.checked_add(b),
                "-" => a.checked_sub(b),
                _ => a.checked_mul(b),
            };
            r.map(Num::Int).ok_or_else(overflow)
        }
        "+" => Ok(Num::Float(x.as_f64() + y.as_f64())),
        "-" => Ok(Num::Float(x.as_f64() - y.as_f64())),
        "*" => Ok(Num::Float(x.as_f64() * y.as_f64())),
        "/" => {
            if y.as_f64() == 0.0 {
                return Err(evaluation("zero_divisor"));
            }
            match (x, y) {
                (Num::Int(a), Num::Int(b)) if a % b == 0 => {
                    a.checked_div(b).map(Num::Int).ok_or_else(overflow)
                }
                _ => Ok(Num::Float(x.as_f64() / y.as_f64())),
            }
        }
        "//" | "mod" | "rem" | "div" => {
            let (a, b) = int_pair(op, x, y)?;
            if b == 0 {
                return Err(evaluation("zero_divisor"));
            }
            let r = match op {
                "//" => a.checked_div(b),
                "rem" => a.checked_rem(b),
                // mod and div round toward negative infinity
                "mod" => a
                    .checked_rem(b)
                    .map(|r| if r != 0 && (r < 0) != (b < 0) { r + b } else { r }),
                _ => a
                    .checked_div(b)
                    .map(|q| if a % b != 0 && (a < 0) != (b < 0) { q - 1 } else { q }),
            };
            r.map(Num::Int).ok_or_else(overflow)
        }
        "min" => Ok(if y.compare(x) == Some(Ordering::Less) { y } else { x }),
        "max" => Ok(if y.compare(x) == Some(Ordering::Greater) { y } else { x }),
        "**" | "^" if both_int => {
            let (a, b) = int_pair(op, x, y)?;
            if b < 0 {
                if op == "**" {
                    return Ok(Num::Float(x.as_f64().powf(y.as_f64())));
                }
                return match a {
                    1 => Ok(Num::Int(1)),
                    -1 => Ok(Num::Int(if b % 2 == 0 { 1 } else { -1 })),
                    _ => Err(evaluation("negative integer exponent")),
                };
            }
            let exp = u32::try_from(b).map_err(|_| overflow())?;
            a.checked_pow(exp).map(Num::Int).ok_or_else(overflow)
        }
        "**" | "^" => Ok(Num::Float(x.as_f64().powf(y.as_f64()))),
        "atan2" | "atan" => Ok(Num::Float(x.as_f64().atan2(y.as_f64()))),
        "log" => {
            let (base, v) = (x.as_f64(), y.as_f64());
            if base <= 0.0 || v <= 0.0 {
                return Err(evaluation("undefined: log of a non-positive number"));
            }
            Ok(Num::Float(v.ln() / base.ln()))
        }
        ">>" | "<<" | "/\\" | "\\/" | "xor" => {
            let (a, b) = int_pair(op, x, y)?;
            let shift = || u32::try_from(b).map_err(|_| evaluation("shift out of range"));
            Ok(Num::Int(match op {
                ">>" => a.checked_shr(shift()?).ok_or_else(overflow)?,
                "<<" => a.checked_shl(shift()?).ok_or_else(overflow)?,
                "/\\" => a & b,
                "\\/" => a | b,
                _ => a ^ b,
            }))
        }
        _ => Err(type_error("evaluable", &Term::Atom(format!("{op}/2")))),
    }
}

fn arith_compare(
    b: &Bindings,
    args: &[Term],
    test: impl Fn(Ordering) -> bool,
) -> Result<bool, InterpreterError> {
    let x = eval(b, &args[0])?;
    let y = eval(b, &args[1])?;
    Ok(x.compare(y).is_some_and(test))
}

// ---------------------------------------------------------------------------
// Term construction
// ---------------------------------------------------------------------------

fn functor(b: &mut Bindings, args: &[Term]) -> Result<bool, InterpreterError> {
    let term = b.deref(&args[0]).clone();
    match &term {
        Term::Var(_) => {
            let name = b.deref(&args[1]).clone();
            let arity = usize::try_from(int_arg(b, &args[2], "functor/3")?)
                .map_err(|_| type_error("non-negative integer", &args[2]))?;
            let built = match &name {
                Term::Var(_) => return Err(instantiation("functor/3")),
                _ if arity == 0 => name.clone(),
                Term::Atom(functor) => {
                    let fresh = (0..arity).map(|_| b.fresh()).collect();
                    Term::Compound(functor.clone(), fresh)
                }
                other => return Err(type_error("atom", other)),
            };
            Ok(b.unify(&term, &built))
        }
        Term::Compound(name, fields) => {
            let arity = i64::try_from(fields.len()).unwrap_or(i64::MAX);
            Ok(b.unify(&args[1], &Term::Atom(name.clone())) && b.unify(&args[2], &Term::Int(arity)))
        }
        atomic => Ok(b.unify(&args[1], atomic) && b.unify(&args[2], &Term::Int(0))),
    }
}

fn arg(b: &mut Bindings, args: &[Term]) -> Result<bool, InterpreterError> {
    let index = int_arg(b, &args[0], "arg/3")?;
    let target = b.deref(&args[1]).clone();
    match &target {
        Term::Compound(_, fields) => {
            let Some(field) = usize::try_from(index)
                .ok()
                .and_then(|i| i.checked_sub(1))
                .and_then(|i| fields.get(i))
            else {
                return Ok(false);
            };
            Ok(b.unify(&args[2], field))
        }
        Term::Var(_) => Err(instantiation("arg/3")),
        other => Err(type_error("compound", other)),
    }
}

fn univ(b: &mut Bindings, args: &[Term]) -> Result<bool, InterpreterError> {
    let target = b.deref(&args[0]).clone();
    match &target {
        Term::Var(_) => {
            let items = list_items(b, &args[1], "=../2")?;
            let mut items = items.into_iter();
            let Some(head) = items.next() else {
                return Err(InterpreterError::Type {
                    expected: "non_empty_list".to_string(),
                    culprit: "[]".to_string(),
                });
            };
            let rest: Vec<Term> = items.collect();
            let built = match &head {
                Term::Atom(name) => Term::compound(name.as_str(), rest),
                _ if rest.is_empty() && !head.is_var() => head.clone(),
                Term::Var(_) => return Err(instantiation("=../2")),
                other => return Err(type_error("atom", other)),
            };
            Ok(b.unify(&args[0], &built))
        }
        Term::Compound(name, fields) => {
            let mut items = vec![Term::Atom(name.clone())];
            items.extend(fields.iter().cloned());
            Ok(b.unify(&args[1], &Term::list(items)))
        }
        _ => Ok(b.unify(&args[1], &Term::list(vec![target.clone()]))),
    }
}

// ---------------------------------------------------------------------------
// Lists
// ---------------------------------------------------------------------------

/// Items of a proper list argument.
fn list_items(b: &Bindings, term: &Term, context: &str) -> Result<Vec<Term>, InterpreterError> {
    let resolved = b.resolve(term);
    match resolved.list_items() {
        Some(items) => Ok(items.into_iter().cloned().collect()),
        None if resolved.is_var() || list_tail_is_var(&resolved) => Err(instantiation(context)),
        None => Err(type_error("list", &resolved)),
    }
}

fn list_tail_is_var(term: &Term) -> bool {
    let mut cur = term;
    loop {
        match cur {
            Term::Compound(name, args) if name == crate::term::LIST_FUNCTOR && args.len() == 2 => {
                cur = &args[1];
            }
            Term::Var(_) => return true,
            _ => return false,
        }
    }
}

fn length(b: &mut Bindings, args: &[Term]) -> Result<bool, InterpreterError> {
    let mut count: i64 = 0;
    let mut cur = b.deref(&args[0]).clone();
    loop {
        let tail = match &cur {
            Term::Compound(name, cell) if name == crate::term::LIST_FUNCTOR && cell.len() == 2 => {
                b.deref(&cell[1]).clone()
            }
            Term::Atom(name) if name == crate::term::NIL => {
                return Ok(b.unify(&args[1], &Term::Int(count)));
            }
            Term::Var(_) => break,
            _ => return Ok(false),
        };
        count += 1;
        cur = tail;
    }
    // Partial list: extend it to the requested length.
    let wanted = match b.deref(&args[1]) {
        Term::Int(n) => *n,
        Term::Var(_) => return Err(instantiation("length/2")),
        other => return Err(type_error("integer", other)),
    };
    if wanted < count {
        return Ok(false);
    }
    let missing = usize::try_from(wanted - count).map_err(|_| overflow())?;
    let fresh = (0..missing).map(|_| b.fresh()).collect();
    Ok(b.unify(&cur, &Term::list(fresh)))
}

fn sort_list(b: &mut Bindings, args: &[Term], dedup: bool) -> Result<bool, InterpreterError> {
    let mut items = list_items(b, &args[0], if dedup { "sort/2" } else { "msort/2" })?;
    items.sort_by(compare_terms);
    if dedup {
        items.dedup_by(|x, y| compare_terms(x, y) == Ordering::Equal);
    }
    Ok(b.unify(&args[1], &Term::list(items)))
}

fn keysort(b: &mut Bindings, args: &[Term]) -> Result<bool, InterpreterError> {
    let items = list_items(b, &args[0], "keysort/2")?;
    let mut pairs = Vec::with_capacity(items.len());
    for item in items {
        match &item {
            Term::Compound(name, kv) if name == "-" && kv.len() == 2 => {
                pairs.push((kv[0].clone(), item));
            }
            Term::Var(_) => return Err(instantiation("keysort/2")),
            other => return Err(type_error("pair", other)),
        }
    }
    pairs.sort_by(|x, y| compare_terms(&x.0, &y.0));
    let sorted = pairs.into_iter().map(|(_, item)| item).collect();
    Ok(b.unify(&args[1], &Term::list(sorted)))
}

fn list_numbers(b: &Bindings, term: &Term, context: &str) -> Result<Vec<Num>, InterpreterError> {
    list_items(b, term, context)?
        .iter()
        .map(|item| eval(b, item))
        .collect()
}

fn extreme_number(b: &mut Bindings, args: &[Term], want: Ordering) -> Result<bool, InterpreterError> {
    let context = if want == Ordering::Greater { "max_list/2" } else { "min_list/2" };
    let nums = list_numbers(b, &args[0], context)?;
    let Some(best) = nums
        .into_iter()
        .reduce(|best, n| if n.compare(best) == Some(want) { n } else { best })
    else {
        return Ok(false);
    };
    Ok(b.unify(&args[1], &best.to_term()))
}

// ---------------------------------------------------------------------------
// Atoms
// ---------------------------------------------------------------------------

fn text_arg(b: &Bindings, term: &Term, context: &str) -> Result<String, InterpreterError> {
    match b.deref(term) {
        Term::Atom(s) | Term::Str(s) => Ok(s.clone()),
        number @ (Term::Int(_) | Term::Float(_)) => Ok(number.to_canonical()),
        Term::Var(_) => Err(instantiation(context)),
        other => Err(type_error("atomic", other)),
    }
}

fn atom_concat(b: &mut Bindings, args: &[Term]) -> Result<bool, InterpreterError> {
    let left = (!b.deref(&args[0]).is_var()).then(|| text_arg(b, &args[0], "atom_concat/3"));
    let right = (!b.deref(&args[1]).is_var()).then(|| text_arg(b, &args[1], "atom_concat/3"));
    match (left.transpose()?, right.transpose()?) {
        (Some(l), Some(r)) => Ok(b.unify(&args[2], &Term::Atom(format!("{l}{r}")))),
        (Some(l), None) => {
            let whole = text_arg(b, &args[2], "atom_concat/3")?;
            Ok(match whole.strip_prefix(&l) {
                Some(rest) => b.unify(&args[1], &Term::atom(rest)),
                None => false,
            })
        }
        (None, Some(r)) => {
            let whole = text_arg(b, &args[2], "atom_concat/3")?;
            Ok(match whole.strip_suffix(&r) {
                Some(rest) => b.unify(&args[0], &Term::atom(rest)),
                None => false,
            })
        }
        (None, None) => Err(instantiation("atom_concat/3")),
    }
}

fn atom_chars(b: &mut Bindings, args: &[Term]) -> Result<bool, InterpreterError> {
    if b.deref(&args[0]).is_var() {
        let items = list_items(b, &args[1], "atom_chars/2")?;
        let mut text = String::new();
        for item in &items {
            text.push_str(&text_arg(b, item, "atom_chars/2")?);
        }
        return Ok(b.unify(&args[0], &Term::Atom(text)));
    }
    let text = text_arg(b, &args[0], "atom_chars/2")?;
    let chars = text.chars().map(|c| Term::Atom(c.to_string())).collect();
    Ok(b.unify(&args[1], &Term::list(chars)))
}

fn atom_number(b: &mut Bindings, args: &[Term]) -> Result<bool, InterpreterError> {
    if b.deref(&args[0]).is_var() {
        return match b.deref(&args[1]).clone() {
            number @ (Term::Int(_) | Term::Float(_)) => {
                Ok(b.unify(&args[0], &Term::Atom(number.to_canonical())))
            }
            Term::Var(_) => Err(instantiation("atom_number/2")),
            other => Err(type_error("number", &other)),
        };
    }
    let text = text_arg(b, &args[0], "atom_number/2")?;
    match parse_term(&text).map(|p| p.term) {
        Ok(number @ (Term::Int(_) | Term::Float(_))) => Ok(b.unify(&args[1], &number)),
        _ => Ok(false),
    }
}

fn join_texts(b: &Bindings, items: &[Term], sep: &str) -> Result<String, InterpreterError> {
    let parts = items
        .iter()
        .map(|item| text_arg(b, item, "atomic_list_concat"))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(parts.join(sep))
}

fn atomic_list_concat_sep(b: &mut Bindings, args: &[Term]) -> Result<bool, InterpreterError> {
    let sep = text_arg(b, &args[1], "atomic_list_concat/3")?;
    let resolved = b.resolve(&args[0]);
    if resolved.is_ground() && resolved.list_items().is_some() {
        let items = list_items(b, &args[0], "atomic_list_concat/3")?;
        let joined = join_texts(b, &items, &sep)?;
        return Ok(b.unify(&args[2], &Term::Atom(joined)));
    }
    if sep.is_empty() {
        return Err(instantiation("atomic_list_concat/3"));
    }
    let whole = text_arg(b, &args[2], "atomic_list_concat/3")?;
    let parts = whole.split(sep.as_str()).map(Term::atom).collect();
    Ok(b.unify(&args[0], &Term::list(parts)))
}

fn term_to_atom(b: &mut Bindings, args: &[Term]) -> Result<bool, InterpreterError> {
    if !b.deref(&args[0]).is_var() {
        let text = b.resolve(&args[0]).to_canonical();
        return Ok(b.unify(&args[1], &Term::Atom(text)));
    }
    let text = text_arg(b, &args[1], "term_to_atom/2")?;
    let parsed = parse_term(&text)?;
    let offset = b.alloc(parsed.var_names.len());
    let term = parsed.term.map_vars(&mut |v| Term::Var(v + offset));
    Ok(b.unify(&args[0], &term))
}

fn succ(b: &mut Bindings, args: &[Term]) -> Result<bool, InterpreterError> {
    match (b.deref(&args[0]).clone(), b.deref(&args[1]).clone()) {
        (Term::Int(x), _) if x >= 0 => {
            let next = x.checked_add(1).ok_or_else(overflow)?;
            Ok(b.unify(&args[1], &Term::Int(next)))
        }
        (Term::Var(_), Term::Int(y)) if y > 0 => Ok(b.unify(&args[0], &Term::Int(y - 1))),
        (Term::Var(_), Term::Int(_)) => Ok(false),
        (Term::Var(_), Term::Var(_)) => Err(instantiation("succ/2")),
        (Term::Int(_), _) => Err(type_error("not_less_than_zero", &args[0])),
        (other, _) => Err(type_error("integer", &other)),
    }
}

// ---------------------------------------------------------------------------
// aggregate_all/3
// ---------------------------------------------------------------------------

fn aggregate_all(m: &mut Machine<'_>, args: &[Term]) -> Result<bool, InterpreterError> {
    let spec = m.bindings.deref(&args[0]).clone();
    let (kind, template) = match &spec {
        Term::Atom(name) if name == "count" => ("count", Term::atom("x")),
        Term::Compound(name, inner) if inner.len() == 1 => (name.as_str(), inner[0].clone()),
        Term::Var(_) => return Err(instantiation("aggregate_all/3")),
        other => return Err(type_error("aggregate_spec", other)),
    };
    let items = m.findall(&template, &args[1])?;
    let result = match kind {
        "count" => Term::Int(i64::try_from(items.len()).unwrap_or(i64::MAX)),
        "bag" => Term::list(items),
        "set" => {
            let mut items = items;
            items.sort_by(compare_terms);
            items.dedup_by(|x, y| compare_terms(x, y) == Ordering::Equal);
            Term::list(items)
        }
        "sum" | "max" | "min" => {
            let nums = items
                .iter()
                .map(|item| eval(&m.bindings, item))
                .collect::<Result<Vec<_>, _>>()?;
            if kind == "sum" {
                nums.into_iter()
                    .try_fold(Num::Int(0), |acc, n| arith2("+", acc, n))?
                    .to_term()
            } else {
                let want = if kind == "max" { Ordering::Greater } else { Ordering::Less };
                match nums
                    .into_iter()
                    .reduce(|best, n| if n.compare(best) == Some(want) { n } else { best })
                {
                    Some(best) => best.to_term(),
                    None => return Ok(false),
                }
            }
        }
        _ => return Err(type_error("aggregate_spec", &spec)),
    };
    Ok(m.bindings.unify(&args[2], &result))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_order_ranks_types() {
        let mut terms = vec![
            Term::compound("f", vec![Term::atom("a")]),
            Term::Str("s".to_string()),
            Term::atom("b"),
            Term::Int(2),
            Term::Float(1.5),
            Term::Var(0),
        ];
        terms.sort_by(compare_terms);
        let written: Vec<String> = terms.iter().map(Term::to_canonical).collect();
        assert_eq!(written, vec!["_G0", "1.5", "2", "b", "\"s\"", "f(a)"]);
    }

    #[test]
    fn equal_int_sorts_after_float() {
        assert_eq!(compare_terms(&Term::Float(1.0), &Term::Int(1)), Ordering::Less);
    }

    #[test]
    fn integer_arithmetic_stays_integral() {
        assert_eq!(arith2("+", Num::Int(2), Num::Int(3)).unwrap(), Num::Int(5));
        assert_eq!(arith2("/", Num::Int(6), Num::Int(3)).unwrap(), Num::Int(2));
        assert_eq!(arith2("/", Num::Int(7), Num::Int(2)).unwrap(), Num::Float(3.5));
        assert_eq!(arith2("mod", Num::Int(-7), Num::Int(12)).unwrap(), Num::Int(5));
        assert_eq!(arith2("**", Num::Int(2), Num::Int(10)).unwrap(), Num::Int(1024));
        assert!(arith2("+", Num::Int(i64::MAX), Num::Int(1)).is_err());
        assert!(arith2("//", Num::Int(1), Num::Int(0)).is_err());
    }

    #[test]
    fn builtin_table_covers_control_and_mutation() {
        assert!(is_builtin("findall", 3));
        assert!(is_builtin("call", 4));
        assert!(is_builtin("retractall", 1));
        assert!(!is_builtin("member", 2));
    }
}
