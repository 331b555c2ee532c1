//! `query_host_actions`: goals in, proposals out.

use std::time::Instant;

use tracing::{debug, warn};

use crate::engine::{AdapterSession, QueryError, QueryOptions};
use crate::term::{parse_term, ParsedTerm, Term};

use super::{proposals_in, ActionProposal, ACTION_FUNCTOR};

impl AdapterSession {
    /// Collects action proposals for `goal`.
    ///
    /// A failed or erroring query yields no proposals; the error is logged.
    /// Use [`query_host_actions_with`](Self::query_host_actions_with) to see it.
    #[must_use]
    pub fn query_host_actions(&self, goal: &str) -> Vec<ActionProposal> {
        self.query_host_actions_with(goal, &QueryOptions::new())
            .unwrap_or_else(|err| {
                warn!(session = %self.id(), goal, error = %err, "action query failed; no proposals");
                Vec::new()
            })
    }

    /// Like [`query_host_actions`](Self::query_host_actions), reporting query
    /// errors instead of swallowing them.
    ///
    /// * a ground `action/3` goal is decoded as written without running it;
    /// * a non-ground `action/3` goal is proved and each instance decoded;
    /// * any other goal is proved and every bound value that is an `action/3`
    ///   term, or a list holding some, is decoded.
    pub fn query_host_actions_with(&self, goal: &str, opts: &QueryOptions) -> Result<Vec<ActionProposal>, QueryError> {
        let submitted = Instant::now();
        let parsed = parse_term(goal)?;
        let is_action = parsed.term.functor() == Some((ACTION_FUNCTOR, 3));

        if is_action && parsed.term.is_ground() {
            let proposals: Vec<_> = ActionProposal::from_term(&parsed.term).into_iter().collect();
            debug!(session = %self.id(), goal, "ground action goal decoded without proving");
            return Ok(proposals);
        }

        let ParsedTerm { term, var_names } = parsed.clone();
        let result = self.submit_parsed(parsed, opts, submitted).join().into_result()?;
        let mut proposals = Vec::new();
        for solution in &result.solutions {
            if is_action {
                let instance = term.map_vars(&mut |v| {
                    var_names
                        .get(v)
                        .and_then(|name| solution.get(name))
                        .cloned()
                        .unwrap_or(Term::Var(v))
                });
                proposals.extend(ActionProposal::from_term(&instance));
            } else {
                let mut seen = Vec::new();
                for name in &var_names {
                    if seen.contains(&name) {
                        continue;
                    }
                    seen.push(name);
                    if let Some(value) = solution.get(name) {
                        proposals_in(value, &mut proposals);
                    }
                }
            }
        }
        debug!(
            session = %self.id(),
            goal,
            solutions = result.solutions.len(),
            proposals = proposals.len(),
            "action query decoded"
        );
        Ok(proposals)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::action::ActionType;
    use crate::engine::SessionConfig;

    const RULES: &str = r"
        suggest(action(set_tempo(B), 0.8, [because('genre tempo')])) :- genre_tempo(B).
        genre_tempo(96).
        genre_tempo(120).
        action(transpose(S), 0.6, [because(range)]) :- member(S, [2, -3]).
        plan([action(set_key(a, minor), 0.7, []), action(mystery(1), 0.1, [])]).
    ";

    fn session() -> AdapterSession {
        let s = AdapterSession::new(SessionConfig::default()).unwrap();
        s.load_program(RULES, "suggestions").unwrap();
        s
    }

    #[test]
    fn ground_goals_echo_without_proving() {
        let s = AdapterSession::new(SessionConfig::default()).unwrap();
        let out = s.query_host_actions("action(set_tempo(120), 0.9, [because('tempo fits genre')])");
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].action_type, ActionType::SetTempo);
        assert_eq!(out[0].payload, json!({"bpm": 120}));
    }

    #[test]
    fn non_ground_action_goals_are_proved() {
        let out = session().query_host_actions("action(transpose(S), C, R)");
        let semis: Vec<_> = out.iter().map(|p| p.payload["semitones"].clone()).collect();
        assert_eq!(semis, vec![json!(2), json!(-3)]);
        assert_eq!(out[0].reasons, vec!["range".to_string()]);
    }

    #[test]
    fn bound_values_and_lists_are_decoded() {
        let s = session();
        let tempos = s.query_host_actions("suggest(A)");
        assert_eq!(tempos.len(), 2);
        assert_eq!(tempos[1].payload, json!({"bpm": 120}));

        let plan = s.query_host_actions("plan(P)");
        assert_eq!(plan.len(), 2);
        assert_eq!(plan[0].action_type, ActionType::SetKey);
        assert!(plan[1].is_unknown());
        assert_eq!(plan[1].raw.as_deref(), Some("mystery(1)"));
    }

    #[test]
    fn failures_yield_no_proposals() {
        let s = session();
        assert!(s.query_host_actions("genre_tempo(1)").is_empty());
        assert!(s.query_host_actions("suggest(").is_empty());
        assert!(matches!(
            s.query_host_actions_with("suggest(", &QueryOptions::new()),
            Err(QueryError::Syntax(_))
        ));
    }
}
