//! Parsed ("compiled") programs.
//!
//! A `Program` is the parse result of module source: normalized clauses plus
//! dynamic declarations. It serializes to JSON, which is what the module cache
//! stores so a cache hit skips reading the source again.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::term::{parse_program, ParsedTerm, PredKey, Term};

use super::InterpreterError;

/// A clause with head, body, and the number of distinct variables it uses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramClause {
    pub head: Term,
    pub body: Term,
    pub var_count: usize,
}

impl ProgramClause {
    /// Splits `Head :- Body` (or a bare fact) into a clause.
    pub fn from_term(term: Term, var_count: usize) -> Result<Self, InterpreterError> {
        let (head, body) = split_clause(term);
        match &head {
            Term::Var(_) => {
                return Err(InterpreterError::Instantiation {
                    context: "clause head".to_string(),
                })
            }
            Term::Atom(_) | Term::Compound(..) => {}
            other => {
                return Err(InterpreterError::Type {
                    expected: "callable".to_string(),
                    culprit: other.to_canonical(),
                })
            }
        }
        if let Some((name, arity)) = head.functor() {
            if is_control(name, arity) {
                return Err(InterpreterError::Permission {
                    message: format!("cannot modify control construct {name}/{arity}"),
                });
            }
        }
        if !matches!(body, Term::Var(_) | Term::Atom(_) | Term::Compound(..)) {
            return Err(InterpreterError::Type {
                expected: "callable".to_string(),
                culprit: body.to_canonical(),
            });
        }
        Ok(Self {
            head,
            body,
            var_count,
        })
    }

    pub fn key(&self) -> PredKey {
        self.head
            .pred_key()
            .unwrap_or_else(|| PredKey::new("", 0))
    }

    pub fn is_fact(&self) -> bool {
        matches!(&self.body, Term::Atom(name) if name == "true")
    }
}

/// Splits `Head :- Body`; any other term is a fact with body `true`.
pub(crate) fn split_clause(term: Term) -> (Term, Term) {
    match term.into_compound() {
        Ok((name, mut args)) if name == ":-" && args.len() == 2 => {
            let body = args.pop().unwrap_or_else(|| Term::atom("true"));
            let head = args.pop().unwrap_or_else(|| Term::atom("true"));
            (head, body)
        }
        Ok((name, args)) => (Term::Compound(name, args), Term::atom("true")),
        Err(other) => (other, Term::atom("true")),
    }
}

pub(crate) fn is_control(name: &str, arity: usize) -> bool {
    matches!(
        (name, arity),
        ("," | ";" | "->" | "*->" | ":-", 2) | ("\\+", 1) | ("!" | "true" | "fail" | "false", 0)
    )
}

/// A parsed module.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Program {
    pub clauses: Vec<ProgramClause>,
    pub dynamic: Vec<PredKey>,
}

impl Program {
    /// Reads module source text.
    pub fn parse(text: &str) -> Result<Self, InterpreterError> {
        let mut program = Self::default();
        for ParsedTerm { term, var_names } in parse_program(text)? {
            match term.into_compound() {
                Ok((name, mut args)) if name == ":-" && args.len() == 1 => {
                    let directive = args.pop().unwrap_or_else(|| Term::atom("true"));
                    program.apply_directive(&directive)?;
                }
                Ok((name, args)) => {
                    let clause = Term::Compound(name, args);
                    program
                        .clauses
                        .push(ProgramClause::from_term(clause, var_names.len())?);
                }
                Err(clause) => {
                    program
                        .clauses
                        .push(ProgramClause::from_term(clause, var_names.len())?);
                }
            }
        }
        Ok(program)
    }

    fn apply_directive(&mut self, directive: &Term) -> Result<(), InterpreterError> {
        match directive.functor() {
            Some(("dynamic", 1)) => {
                collect_indicators(&directive.args()[0], &mut self.dynamic)
            }
            Some(("discontiguous" | "ensure_loaded" | "use_module" | "module", _)) => Ok(()),
            _ => Err(InterpreterError::Permission {
                message: format!("unsupported directive {}", directive.to_canonical()),
            }),
        }
    }

    /// Serialized form stored in the module cache.
    pub fn to_compiled_text(&self) -> Result<String, InterpreterError> {
        serde_json::to_string(self).map_err(|e| InterpreterError::Syntax {
            message: format!("failed to serialize program: {e}"),
        })
    }

    /// Inverse of `to_compiled_text`.
    pub fn from_compiled_text(text: &str) -> Result<Self, InterpreterError> {
        serde_json::from_str(text).map_err(|e| InterpreterError::Syntax {
            message: format!("corrupt compiled program: {e}"),
        })
    }

    /// Predicates this program defines clauses for or declares dynamic.
    pub fn defined_predicates(&self) -> BTreeSet<PredKey> {
        self.clauses
            .iter()
            .map(ProgramClause::key)
            .chain(self.dynamic.iter().cloned())
            .collect()
    }
}

fn collect_indicators(spec: &Term, out: &mut Vec<PredKey>) -> Result<(), InterpreterError> {
    match spec {
        Term::Compound(name, args) if (name == "," || name == crate::term::LIST_FUNCTOR) && args.len() == 2 => {
            collect_indicators(&args[0], out)?;
            collect_indicators(&args[1], out)
        }
        Term::Atom(name) if name == crate::term::NIL => Ok(()),
        Term::Compound(name, args) if name == "/" && args.len() == 2 => match (&args[0], &args[1]) {
            (Term::Atom(pred), Term::Int(arity)) if *arity >= 0 => {
                #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
                out.push(PredKey::new(pred.clone(), *arity as usize));
                Ok(())
            }
            _ => Err(InterpreterError::Type {
                expected: "predicate_indicator".to_string(),
                culprit: spec.to_canonical(),
            }),
        },
        other => Err(InterpreterError::Type {
            expected: "predicate_indicator".to_string(),
            culprit: other.to_canonical(),
        }),
    }
}
