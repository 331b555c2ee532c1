//! Term model for the rule language.
//!
//! Terms are the currency between the adapter and the interpreter: goals are
//! read into terms, answers come back as terms, and the bridges build facts as
//! terms before writing them in canonical text.
//!
//! Lists use the `'[|]'/2` functor with `[]` as the empty list.

mod convert;
mod parser;

use std::collections::BTreeSet;
use std::fmt::{self, Write as _};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

pub use convert::{json_to_term, json_to_term_string, term_to_json};
pub use parser::{parse_program, parse_term, ParsedTerm};

/// Index of a variable inside one clause or query.
pub type VarId = usize;

/// Functor of a list cell.
pub const LIST_FUNCTOR: &str = "[|]";

/// The empty list atom.
pub const NIL: &str = "[]";

/// A term of the rule language.
///
/// `Clone`, `PartialEq` and `Drop` walk with an explicit stack, so list spines
/// of any length stay off the call stack.
#[allow(missing_docs)]
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "t", content = "v", rename_all = "snake_case")]
pub enum Term {
    Atom(String),
    Int(i64),
    Float(f64),
    Str(String),
    Var(VarId),
    Compound(String, Vec<Term>),
}

#[allow(missing_docs)]
impl Term {
    pub fn atom(name: impl Into<String>) -> Self {
        Self::Atom(name.into())
    }

    pub fn compound(name: impl Into<String>, args: Vec<Term>) -> Self {
        let name = name.into();
        if args.is_empty() {
            Self::Atom(name)
        } else {
            Self::Compound(name, args)
        }
    }

    #[must_use]
    pub fn nil() -> Self {
        Self::Atom(NIL.to_string())
    }

    /// Builds a proper list.
    #[must_use]
    pub fn list(items: Vec<Term>) -> Self {
        Self::list_with_tail(items, Self::nil())
    }

    /// Builds a list ending in `tail`.
    #[must_use]
    pub fn list_with_tail(items: Vec<Term>, tail: Term) -> Self {
        items.into_iter().rev().fold(tail, |acc, item| {
            Self::Compound(LIST_FUNCTOR.to_string(), vec![item, acc])
        })
    }

    pub const fn is_var(&self) -> bool {
        matches!(self, Self::Var(_))
    }

    pub const fn is_number(&self) -> bool {
        matches!(self, Self::Int(_) | Self::Float(_))
    }

    pub const fn is_callable(&self) -> bool {
        matches!(self, Self::Atom(_) | Self::Compound(..))
    }

    pub fn as_atom(&self) -> Option<&str> {
        match self {
            Self::Atom(name) => Some(name),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            #[allow(clippy::cast_precision_loss)]
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// Name and arity of a callable term.
    pub fn functor(&self) -> Option<(&str, usize)> {
        match self {
            Self::Atom(name) => Some((name, 0)),
            Self::Compound(name, args) => Some((name, args.len())),
            _ => None,
        }
    }

    pub fn pred_key(&self) -> Option<PredKey> {
        self.functor().map(|(name, arity)| PredKey::new(name, arity))
    }

    pub fn args(&self) -> &[Term] {
        match self {
            Self::Compound(_, args) => args,
            _ => &[],
        }
    }

    /// Items of a proper list, or `None` for anything else.
    pub fn list_items(&self) -> Option<Vec<&Term>> {
        let mut items = Vec::new();
        let mut cur = self;
        loop {
            match cur {
                Self::Atom(name) if name == NIL => return Some(items),
                Self::Compound(name, args) if name == LIST_FUNCTOR && args.len() == 2 => {
                    items.push(&args[0]);
                    cur = &args[1];
                }
                _ => return None,
            }
        }
    }

    pub fn is_ground(&self) -> bool {
        let mut pending = vec![self];
        while let Some(term) = pending.pop() {
            match term {
                Self::Var(_) => return false,
                Self::Compound(_, args) => pending.extend(args),
                _ => {}
            }
        }
        true
    }

    /// Collects the distinct variables of this term in first-occurrence order.
    pub fn variables(&self) -> Vec<VarId> {
        let mut seen = BTreeSet::new();
        let mut out = Vec::new();
        let mut pending = vec![self];
        while let Some(term) = pending.pop() {
            match term {
                Self::Var(v) => {
                    if seen.insert(*v) {
                        out.push(*v);
                    }
                }
                Self::Compound(_, args) => pending.extend(args.iter().rev()),
                _ => {}
            }
        }
        out
    }

    /// Rewrites every variable through `f`.
    #[must_use]
    pub fn map_vars(&self, f: &mut impl FnMut(VarId) -> Term) -> Self {
        rebuild(self, |term| match term {
            Self::Var(v) => Visit::Replace(f(*v)),
            Self::Compound(name, args) => Visit::Descend(name, args),
            leaf => Visit::Replace(leaf.clone()),
        })
    }

    /// Splits a compound into its name and arguments; anything else comes back
    /// unchanged.
    pub fn into_compound(mut self) -> Result<(String, Vec<Term>), Self> {
        if let Self::Compound(name, args) = &mut self {
            return Ok((std::mem::take(name), std::mem::take(args)));
        }
        Err(self)
    }

    /// Canonical text with variables written as `_G<n>`.
    #[must_use]
    pub fn to_canonical(&self) -> String {
        let mut out = String::new();
        write_term(&mut out, self, &|v| format!("_G{v}"));
        out
    }

    /// Canonical text with variables named from `names` (falling back to `_G<n>`).
    #[must_use]
    pub fn to_canonical_named(&self, names: &[String]) -> String {
        let mut out = String::new();
        write_term(&mut out, self, &|v| match names.get(v) {
            Some(name) if name != "_" => name.clone(),
            _ => format!("_G{v}"),
        });
        out
    }

    /// Text for human-facing output: atoms and strings unquoted, everything
    /// else canonical.
    #[must_use]
    pub fn to_plain_text(&self) -> String {
        match self {
            Self::Atom(name) | Self::Str(name) => name.clone(),
            other => other.to_canonical(),
        }
    }
}

impl Clone for Term {
    fn clone(&self) -> Self {
        match self {
            Self::Atom(name) => Self::Atom(name.clone()),
            Self::Int(v) => Self::Int(*v),
            Self::Float(v) => Self::Float(*v),
            Self::Str(s) => Self::Str(s.clone()),
            Self::Var(v) => Self::Var(*v),
            Self::Compound(..) => rebuild(self, |term| match term {
                Self::Compound(name, args) => Visit::Descend(name, args),
                leaf => Visit::Replace(leaf.clone()),
            }),
        }
    }
}

impl PartialEq for Term {
    fn eq(&self, other: &Self) -> bool {
        let mut pending = vec![(self, other)];
        while let Some(pair) = pending.pop() {
            let same = match pair {
                (Self::Atom(x), Self::Atom(y)) | (Self::Str(x), Self::Str(y)) => x == y,
                (Self::Int(x), Self::Int(y)) => x == y,
                #[allow(clippy::float_cmp)]
                (Self::Float(x), Self::Float(y)) => x == y,
                (Self::Var(x), Self::Var(y)) => x == y,
                (Self::Compound(f, xs), Self::Compound(g, ys)) if f == g && xs.len() == ys.len() => {
                    pending.extend(xs.iter().zip(ys));
                    true
                }
                _ => false,
            };
            if !same {
                return false;
            }
        }
        true
    }
}

impl Drop for Term {
    fn drop(&mut self) {
        let Self::Compound(_, args) = self else {
            return;
        };
        if !args.iter().any(|arg| matches!(arg, Self::Compound(..))) {
            return;
        }
        let mut pending = std::mem::take(args);
        while let Some(mut term) = pending.pop() {
            if let Self::Compound(_, inner) = &mut term {
                pending.append(inner);
            }
        }
    }
}

/// What [`rebuild`] does with one node.
pub(crate) enum Visit<'a> {
    /// Use this term in place of the node.
    Replace(Term),
    /// Rebuild a compound from its rebuilt arguments.
    Descend(&'a str, &'a [Term]),
}

/// Rebuilds `root` bottom-up, letting `visit` replace or descend into each
/// node. Uses a heap stack instead of recursion.
pub(crate) fn rebuild<'a>(root: &'a Term, mut visit: impl FnMut(&'a Term) -> Visit<'a>) -> Term {
    struct Open<'a> {
        name: &'a str,
        args: &'a [Term],
        done: Vec<Term>,
    }

    let mut open: Vec<Open<'a>> = Vec::new();
    let mut next = root;
    loop {
        let mut value = match visit(next) {
            Visit::Replace(term) => term,
            Visit::Descend(name, []) => Term::Compound(name.to_string(), Vec::new()),
            Visit::Descend(name, args) => {
                open.push(Open {
                    name,
                    args,
                    done: Vec::with_capacity(args.len()),
                });
                next = &args[0];
                continue;
            }
        };
        loop {
            let Some(mut top) = open.pop() else {
                return value;
            };
            top.done.push(value);
            let args = top.args;
            if let Some(arg) = args.get(top.done.len()) {
                next = arg;
                open.push(top);
                break;
            }
            value = Term::Compound(top.name.to_string(), top.done);
        }
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_canonical())
    }
}

impl From<&str> for Term {
    fn from(v: &str) -> Self {
        Self::Atom(v.to_string())
    }
}

impl From<i64> for Term {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for Term {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

/// Predicate indicator: functor name and arity.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PredKey {
    pub name: String,
    pub arity: usize,
}

impl PredKey {
    /// Builds `name/arity`.
    pub fn new(name: impl Into<String>, arity: usize) -> Self {
        Self {
            name: name.into(),
            arity,
        }
    }
}

impl fmt::Display for PredKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.name, self.arity)
    }
}

impl FromStr for PredKey {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ValidationError::InvalidIdentifier {
            value: s.to_string(),
            reason: "expected name/arity".to_string(),
        };
        let (name, arity) = s.rsplit_once('/').ok_or_else(invalid)?;
        let arity = arity.trim().parse::<usize>().map_err(|_| invalid())?;
        let name = name.trim();
        if name.is_empty() {
            return Err(invalid());
        }
        Ok(Self::new(name, arity))
    }
}

const SYMBOL_CHARS: &str = "+-*/\\^<>=~:.?@#&$";

pub(crate) fn is_symbol_char(c: char) -> bool {
    SYMBOL_CHARS.contains(c)
}

fn atom_needs_quotes(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return true;
    };
    if first.is_ascii_lowercase() {
        return !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    }
    if matches!(name, "[]" | "!" | ";") {
        return false;
    }
    if name == "." {
        return true;
    }
    !name.chars().all(is_symbol_char)
}

fn write_quoted(out: &mut String, text: &str, quote: char) {
    out.push(quote);
    for c in text.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            c if c == quote => {
                out.push('\\');
                out.push(c);
            }
            c => out.push(c),
        }
    }
    out.push(quote);
}

pub(crate) fn write_atom(out: &mut String, name: &str) {
    if atom_needs_quotes(name) {
        write_quoted(out, name, '\'');
    } else {
        out.push_str(name);
    }
}

fn write_float(out: &mut String, v: f64) {
    if v.is_nan() {
        out.push_str("nan");
        return;
    }
    if v.is_infinite() {
        out.push_str(if v > 0.0 { "inf" } else { "-inf" });
        return;
    }
    let text = format!("{v:?}");
    match text.find('e') {
        Some(idx) if !text[..idx].contains('.') => {
            out.push_str(&text[..idx]);
            out.push_str(".0");
            out.push_str(&text[idx..]);
        }
        _ => out.push_str(&text),
    }
}

fn write_term(out: &mut String, term: &Term, name_var: &dyn Fn(VarId) -> String) {
    match term {
        Term::Atom(name) => write_atom(out, name),
        Term::Int(v) => {
            let _ = write!(out, "{v}");
        }
        Term::Float(v) => write_float(out, *v),
        Term::Str(s) => write_quoted(out, s, '"'),
        Term::Var(v) => out.push_str(&name_var(*v)),
        Term::Compound(name, args) if name == LIST_FUNCTOR && args.len() == 2 => {
            out.push('[');
            write_term(out, &args[0], name_var);
            let mut tail = &args[1];
            loop {
                match tail {
                    Term::Compound(n, a) if n == LIST_FUNCTOR && a.len() == 2 => {
                        out.push(',');
                        write_term(out, &a[0], name_var);
                        tail = &a[1];
                    }
                    Term::Atom(n) if n == NIL => break,
                    other => {
                        out.push('|');
                        write_term(out, other, name_var);
                        break;
                    }
                }
            }
            out.push(']');
        }
        Term::Compound(name, args) => {
            write_atom(out, name);
            out.push('(');
            for (idx, arg) in args.iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                write_term(out, arg, name_var);
            }
            out.push(')');
        }
    }
}
