//! List library loaded into every resolver before user modules.

use super::database::Database;
use super::program::Program;
use super::InterpreterError;

const LIBRARY: &str = r"
member(X, [X|_]).
member(X, [_|T]) :- member(X, T).

memberchk(X, L) :- member(X, L), !.

append([], L, L).
append([H|T], L, [H|R]) :- append(T, L, R).

reverse(L, R) :- '$reverse'(L, [], R).
'$reverse'([], Acc, Acc).
'$reverse'([H|T], Acc, R) :- '$reverse'(T, [H|Acc], R).

last([X], X) :- !.
last([_|T], X) :- last(T, X).

nth0(I, L, E) :- integer(I), !, I >= 0, '$nth'(L, I, E).
nth0(I, L, E) :- var(I), '$nth_enum'(L, 0, I, E).
nth1(I, L, E) :- integer(I), !, I >= 1, I0 is I - 1, '$nth'(L, I0, E).
nth1(I, L, E) :- var(I), '$nth_enum'(L, 1, I, E).
'$nth'([X|_], 0, X) :- !.
'$nth'([_|T], I, X) :- I1 is I - 1, '$nth'(T, I1, X).
'$nth_enum'([X|_], B, B, X).
'$nth_enum'([_|T], B0, I, X) :- B1 is B0 + 1, '$nth_enum'(T, B1, I, X).

select(X, [X|T], T).
select(X, [H|T], [H|R]) :- select(X, T, R).

maplist(_, []).
maplist(G, [X|Xs]) :- call(G, X), maplist(G, Xs).
maplist(_, [], []).
maplist(G, [X|Xs], [Y|Ys]) :- call(G, X, Y), maplist(G, Xs, Ys).

include(_, [], []).
include(P, [X|Xs], R) :- ( call(P, X) -> R = [X|R1] ; R = R1 ), include(P, Xs, R1).
exclude(_, [], []).
exclude(P, [X|Xs], R) :- ( call(P, X) -> R = R1 ; R = [X|R1] ), exclude(P, Xs, R1).
";

/// Consults the library and locks its predicates against redefinition.
pub(crate) fn install(db: &mut Database) -> Result<(), InterpreterError> {
    let program = Program::parse(LIBRARY)?;
    for clause in program.clauses {
        db.add(clause, None, true);
    }
    db.lock_all();
    Ok(())
}
