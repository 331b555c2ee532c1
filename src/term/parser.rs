//! Reader for rule-language text.
//!
//! Standard operator-precedence syntax: quoted atoms, strings, lists, curly
//! terms, `0'c` character codes, and the usual operator table. Comments are
//! `% ...` and `/* ... */`.

use std::collections::HashMap;

use crate::interpreter::InterpreterError;

use super::{is_symbol_char, Term, VarId};

/// A term read from text, together with its variable names.
///
/// Variable `i` of `term` is named `var_names[i]`. Anonymous variables are
/// named `_`.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedTerm {
    pub term: Term,
    pub var_names: Vec<String>,
}

/// Reads exactly one term. A trailing `.` is optional.
pub fn parse_term(text: &str) -> Result<ParsedTerm, InterpreterError> {
    let tokens = Lexer::new(text).tokenize()?;
    let mut parser = Parser::new(text, tokens);
    let parsed = parser.read_clause()?.ok_or_else(|| InterpreterError::Syntax {
        message: "empty input".to_string(),
    })?;
    if !parser.at_eof() {
        return Err(parser.error("unexpected text after term"));
    }
    Ok(parsed)
}

/// Reads a sequence of `.`-terminated clauses.
pub fn parse_program(text: &str) -> Result<Vec<ParsedTerm>, InterpreterError> {
    let tokens = Lexer::new(text).tokenize()?;
    let mut parser = Parser::new(text, tokens);
    let mut out = Vec::new();
    while !parser.at_eof() {
        let start = parser.pos;
        match parser.read_clause()? {
            Some(clause) => {
                if !parser.last_was_end {
                    return Err(parser.error_at(start, "clause is missing its terminating '.'"));
                }
                out.push(clause);
            }
            None => break,
        }
    }
    Ok(out)
}

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Atom(String),
    QuotedAtom(String),
    Var(String),
    /// Magnitude of an integer literal; the sign is applied by the parser.
    Int(u64),
    Float(f64),
    Str(String),
    Punct(char),
    End,
}

#[derive(Debug, Clone)]
struct Token {
    tok: Tok,
    layout_before: bool,
    offset: usize,
}

struct Lexer<'a> {
    src: &'a str,
    chars: Vec<(usize, char)>,
    pos: usize,
}

impl<'a> Lexer<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            src,
            chars: src.char_indices().collect(),
            pos: 0,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).map(|(_, c)| *c)
    }

    fn peek_at(&self, ahead: usize) -> Option<char> {
        self.chars.get(self.pos + ahead).map(|(_, c)| *c)
    }

    fn offset(&self) -> usize {
        self.chars.get(self.pos).map_or(self.src.len(), |(o, _)| *o)
    }

    fn error(&self, message: &str) -> InterpreterError {
        syntax_error(self.src, self.offset(), message)
    }

    /// Skips whitespace and comments; returns whether anything was skipped.
    fn skip_layout(&mut self) -> Result<bool, InterpreterError> {
        let start = self.pos;
        loop {
            match self.peek() {
                Some(c) if c.is_whitespace() => self.pos += 1,
                Some('%') => {
                    while let Some(c) = self.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.pos += 1;
                    }
                }
                Some('/') if self.peek_at(1) == Some('*') => {
                    self.pos += 2;
                    loop {
                        match self.peek() {
                            None => return Err(self.error("unterminated block comment")),
                            Some('*') if self.peek_at(1) == Some('/') => {
                                self.pos += 2;
                                break;
                            }
                            Some(_) => self.pos += 1,
                        }
                    }
                }
                _ => break,
            }
        }
        Ok(self.pos != start)
    }

    fn tokenize(mut self) -> Result<Vec<Token>, InterpreterError> {
        let mut out = Vec::new();
        loop {
            let layout_before = self.skip_layout()?;
            let offset = self.offset();
            let Some(c) = self.peek() else {
                break;
            };
            let tok = if c.is_ascii_digit() {
                self.number()?
            } else if c == '_' || c.is_uppercase() {
                Tok::Var(self.word())
            } else if c.is_alphabetic() {
                Tok::Atom(self.word())
            } else if c == '\'' {
                Tok::QuotedAtom(self.quoted('\'')?)
            } else if c == '"' {
                Tok::Str(self.quoted('"')?)
            } else if "()[]{},|".contains(c) {
                self.pos += 1;
                Tok::Punct(c)
            } else if c == '!' || c == ';' {
                self.pos += 1;
                Tok::Atom(c.to_string())
            } else if is_symbol_char(c) {
                let start = self.pos;
                while self.peek().is_some_and(is_symbol_char) {
                    self.pos += 1;
                }
                let run: String = self.chars[start..self.pos].iter().map(|(_, c)| c).collect();
                let at_boundary = self
                    .peek()
                    .map_or(true, |next| next.is_whitespace() || next == '%');
                if run == "." && at_boundary {
                    Tok::End
                } else {
                    Tok::Atom(run)
                }
            } else {
                return Err(self.error(&format!("unexpected character '{c}'")));
            };
            out.push(Token {
                tok,
                layout_before,
                offset,
            });
        }
        Ok(out)
    }

    fn word(&mut self) -> String {
        let start = self.pos;
        while self
            .peek()
            .is_some_and(|c| c.is_alphanumeric() || c == '_')
        {
            self.pos += 1;
        }
        self.chars[start..self.pos].iter().map(|(_, c)| c).collect()
    }

    fn digits(&mut self, radix: u32) -> String {
        let start = self.pos;
        while self
            .peek()
            .is_some_and(|c| c.is_digit(radix) || c == '_')
        {
            self.pos += 1;
        }
        self.chars[start..self.pos]
            .iter()
            .map(|(_, c)| *c)
            .filter(|c| *c != '_')
            .collect()
    }

    fn number(&mut self) -> Result<Tok, InterpreterError> {
        if self.peek() == Some('0') {
            match self.peek_at(1) {
                Some('\'') => {
                    self.pos += 2;
                    let c = match self.peek() {
                        Some('\\') => {
                            self.pos += 1;
                            self.escape()?
                        }
                        Some('\'') if self.peek_at(1) == Some('\'') => {
                            self.pos += 1;
                            '\''
                        }
                        Some(c) => c,
                        None => return Err(self.error("unterminated character code")),
                    };
                    self.pos += 1;
                    return Ok(Tok::Int(u64::from(u32::from(c))));
                }
                Some('x') | Some('o') | Some('b') => {
                    let radix = match self.peek_at(1) {
                        Some('x') => 16,
                        Some('o') => 8,
                        _ => 2,
                    };
                    if self.peek_at(2).is_some_and(|c| c.is_digit(radix)) {
                        self.pos += 2;
                        let text = self.digits(radix);
                        return u64::from_str_radix(&text, radix)
                            .map(Tok::Int)
                            .map_err(|_| self.error("integer literal out of range"));
                    }
                }
                _ => {}
            }
        }

        let mut text = self.digits(10);
        let mut is_float = false;
        if self.peek() == Some('.') && self.peek_at(1).is_some_and(|c| c.is_ascii_digit()) {
            self.pos += 1;
            text.push('.');
            text.push_str(&self.digits(10));
            is_float = true;
        }
        if matches!(self.peek(), Some('e') | Some('E')) {
            let sign = self.peek_at(1);
            let digit_at = if matches!(sign, Some('+') | Some('-')) { 2 } else { 1 };
            if self.peek_at(digit_at).is_some_and(|c| c.is_ascii_digit()) {
                text.push('e');
                if digit_at == 2 {
                    text.push(sign.unwrap_or('+'));
                }
                self.pos += digit_at;
                text.push_str(&self.digits(10));
                is_float = true;
            }
        }
        if is_float {
            text.parse::<f64>()
                .map(Tok::Float)
                .map_err(|_| self.error("malformed float literal"))
        } else {
            text.parse::<u64>()
                .map(Tok::Int)
                .map_err(|_| self.error("integer literal out of range"))
        }
    }

    fn escape(&mut self) -> Result<char, InterpreterError> {
        match self.peek() {
            Some('n') => Ok('\n'),
            Some('t') => Ok('\t'),
            Some('r') => Ok('\r'),
            Some('0') => Ok('\0'),
            Some(c @ ('\\' | '\'' | '"' | '`')) => Ok(c),
            Some(c) => Err(self.error(&format!("unknown escape '\\{c}'"))),
            None => Err(self.error("unterminated escape")),
        }
    }

    fn quoted(&mut self, quote: char) -> Result<String, InterpreterError> {
        self.pos += 1;
        let mut out = String::new();
        loop {
            match self.peek() {
                None => return Err(self.error("unterminated quoted text")),
                Some(c) if c == quote => {
                    if self.peek_at(1) == Some(quote) {
                        out.push(quote);
                        self.pos += 2;
                    } else {
                        self.pos += 1;
                        return Ok(out);
                    }
                }
                Some('\\') => {
                    self.pos += 1;
                    if self.peek() == Some('\n') {
                        self.pos += 1;
                        continue;
                    }
                    out.push(self.escape()?);
                    self.pos += 1;
                }
                Some(c) => {
                    out.push(c);
                    self.pos += 1;
                }
            }
        }
    }
}

fn syntax_error(src: &str, offset: usize, message: &str) -> InterpreterError {
    let before = &src[..offset.min(src.len())];
    let line = before.matches('\n').count() + 1;
    let column = before.rsplit('\n').next().map_or(0, |l| l.chars().count()) + 1;
    InterpreterError::Syntax {
        message: format!("{message} at line {line}, column {column}"),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Assoc {
    Xfx,
    Xfy,
    Yfx,
    Fy,
    Fx,
}

fn infix_op(name: &str) -> Option<(u32, Assoc)> {
    Some(match name {
        ":-" | "-->" => (1200, Assoc::Xfx),
        ";" | "|" => (1100, Assoc::Xfy),
        "->" | "*->" => (1050, Assoc::Xfy),
        "," => (1000, Assoc::Xfy),
        "=" | "\\=" | "==" | "\\==" | "@<" | "@>" | "@=<" | "@>=" | "=.." | "is" | "=:="
        | "=\\=" | "<" | ">" | "=<" | ">=" => (700, Assoc::Xfx),
        "+" | "-" | "/\\" | "\\/" | "xor" => (500, Assoc::Yfx),
        "*" | "/" | "//" | "rem" | "mod" | "div" | "<<" | ">>" => (400, Assoc::Yfx),
        "**" => (200, Assoc::Xfx),
        "^" => (200, Assoc::Xfy),
        ":" => (200, Assoc::Xfy),
        _ => return None,
    })
}

fn prefix_op(name: &str) -> Option<(u32, Assoc)> {
    Some(match name {
        ":-" | "?-" => (1200, Assoc::Fx),
        "dynamic" | "discontiguous" => (1150, Assoc::Fx),
        "\\+" => (900, Assoc::Fy),
        "-" | "+" | "\\" => (200, Assoc::Fy),
        _ => return None,
    })
}

struct Parser<'a> {
    src: &'a str,
    tokens: Vec<Token>,
    pos: usize,
    var_map: HashMap<String, VarId>,
    var_names: Vec<String>,
    last_was_end: bool,
}

impl<'a> Parser<'a> {
    fn new(src: &'a str, tokens: Vec<Token>) -> Self {
        Self {
            src,
            tokens,
            pos: 0,
            var_map: HashMap::new(),
            var_names: Vec::new(),
            last_was_end: false,
        }
    }

    fn at_eof(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_at(&self, ahead: usize) -> Option<&Token> {
        self.tokens.get(self.pos + ahead)
    }

    fn error(&self, message: &str) -> InterpreterError {
        self.error_at(self.pos, message)
    }

    fn error_at(&self, token_idx: usize, message: &str) -> InterpreterError {
        let offset = self
            .tokens
            .get(token_idx)
            .map_or(self.src.len(), |t| t.offset);
        syntax_error(self.src, offset, message)
    }

    fn read_clause(&mut self) -> Result<Option<ParsedTerm>, InterpreterError> {
        if self.at_eof() {
            return Ok(None);
        }
        self.var_map.clear();
        self.var_names.clear();
        let (term, _) = self.parse(1200)?;
        self.last_was_end = false;
        match self.peek() {
            Some(Token { tok: Tok::End, .. }) => {
                self.pos += 1;
                self.last_was_end = true;
            }
            None => {}
            Some(_) => return Err(self.error("operator priority clash or missing '.'")),
        }
        Ok(Some(ParsedTerm {
            term,
            var_names: std::mem::take(&mut self.var_names),
        }))
    }

    fn expect_punct(&mut self, c: char) -> Result<(), InterpreterError> {
        match self.peek() {
            Some(Token {
                tok: Tok::Punct(p), ..
            }) if *p == c => {
                self.pos += 1;
                Ok(())
            }
            _ => Err(self.error(&format!("expected '{c}'"))),
        }
    }

    fn is_punct(&self, ahead: usize, c: char) -> bool {
        matches!(self.peek_at(ahead), Some(Token { tok: Tok::Punct(p), .. }) if *p == c)
    }

    fn var(&mut self, name: String) -> Term {
        if name == "_" {
            self.var_names.push(name);
            return Term::Var(self.var_names.len() - 1);
        }
        if let Some(id) = self.var_map.get(&name) {
            return Term::Var(*id);
        }
        let id = self.var_names.len();
        self.var_names.push(name.clone());
        self.var_map.insert(name, id);
        Term::Var(id)
    }

    /// True when the upcoming token can begin a term.
    fn starts_term(&self) -> bool {
        match self.peek() {
            None => false,
            Some(t) => match &t.tok {
                Tok::End => false,
                Tok::Punct(c) => matches!(c, '(' | '[' | '{'),
                Tok::Atom(name) => infix_op(name).is_none() || prefix_op(name).is_some() || self.is_punct(1, '('),
                _ => true,
            },
        }
    }

    fn parse(&mut self, max: u32) -> Result<(Term, u32), InterpreterError> {
        let (mut left, mut left_prec) = self.parse_primary(max)?;
        loop {
            let name = match self.peek().map(|t| &t.tok) {
                Some(Tok::Atom(name)) => name.clone(),
                Some(Tok::Punct(',')) => ",".to_string(),
                Some(Tok::Punct('|')) => "|".to_string(),
                _ => break,
            };
            let Some((prec, assoc)) = infix_op(&name) else {
                break;
            };
            let (left_max, right_max) = match assoc {
                Assoc::Xfy => (prec - 1, prec),
                Assoc::Yfx => (prec, prec - 1),
                _ => (prec - 1, prec - 1),
            };
            if prec > max || left_prec > left_max {
                break;
            }
            self.pos += 1;
            let (right, _) = self.parse(right_max)?;
            let functor = if name == "|" { ";".to_string() } else { name };
            left = Term::Compound(functor, vec![left, right]);
            left_prec = prec;
        }
        Ok((left, left_prec))
    }

    fn parse_arglist(&mut self) -> Result<Vec<Term>, InterpreterError> {
        let mut args = Vec::new();
        loop {
            let (arg, _) = self.parse(999)?;
            args.push(arg);
            if self.is_punct(0, ',') {
                self.pos += 1;
            } else {
                break;
            }
        }
        self.expect_punct(')')?;
        Ok(args)
    }

    fn parse_primary(&mut self, max: u32) -> Result<(Term, u32), InterpreterError> {
        let Some(token) = self.peek().cloned() else {
            return Err(self.error("unexpected end of input"));
        };
        self.pos += 1;
        match token.tok {
            Tok::Int(v) => {
                let v = i64::try_from(v).map_err(|_| self.error_at(self.pos - 1, "integer literal out of range"))?;
                Ok((Term::Int(v), 0))
            }
            Tok::Float(v) => Ok((Term::Float(v), 0)),
            Tok::Str(s) => Ok((Term::Str(s), 0)),
            Tok::Var(name) => Ok((self.var(name), 0)),
            Tok::End => Err(self.error_at(self.pos - 1, "unexpected '.'")),
            Tok::Punct('(') => {
                let (inner, _) = self.parse(1200)?;
                self.expect_punct(')')?;
                Ok((inner, 0))
            }
            Tok::Punct('[') => {
                if self.is_punct(0, ']') {
                    self.pos += 1;
                    return self.after_atom("[]".to_string(), max, false);
                }
                let mut items = Vec::new();
                loop {
                    let (item, _) = self.parse(999)?;
                    items.push(item);
                    if self.is_punct(0, ',') {
                        self.pos += 1;
                    } else {
                        break;
                    }
                }
                let tail = if self.is_punct(0, '|') {
                    self.pos += 1;
                    self.parse(999)?.0
                } else {
                    Term::nil()
                };
                self.expect_punct(']')?;
                Ok((Term::list_with_tail(items, tail), 0))
            }
            Tok::Punct('{') => {
                if self.is_punct(0, '}') {
                    self.pos += 1;
                    return self.after_atom("{}".to_string(), max, false);
                }
                let (inner, _) = self.parse(1200)?;
                self.expect_punct('}')?;
                Ok((Term::Compound("{}".to_string(), vec![inner]), 0))
            }
            Tok::Punct(c) => Err(self.error_at(self.pos - 1, &format!("unexpected '{c}'"))),
            Tok::QuotedAtom(name) => self.after_atom(name, max, true),
            Tok::Atom(name) => {
                if (name == "-" || name == "+") && !self.is_punct(0, '(') {
                    if let Some(next) = self.peek() {
                        if !next.layout_before {
                            let negate = name == "-";
                            match next.tok {
                                Tok::Int(v) => {
                                    self.pos += 1;
                                    let signed = if negate {
                                        0_i64.checked_sub_unsigned(v)
                                    } else {
                                        i64::try_from(v).ok()
                                    };
                                    let v = signed
                                        .ok_or_else(|| self.error_at(self.pos - 1, "integer literal out of range"))?;
                                    return Ok((Term::Int(v), 0));
                                }
                                Tok::Float(v) => {
                                    self.pos += 1;
                                    return Ok((Term::Float(if negate { -v } else { v }), 0));
                                }
                                _ => {}
                            }
                        }
                    }
                }
                self.after_atom(name, max, false)
            }
        }
    }

    fn after_atom(&mut self, name: String, max: u32, quoted: bool) -> Result<(Term, u32), InterpreterError> {
        if let Some(Token {
            tok: Tok::Punct('('),
            layout_before: false,
            ..
        }) = self.peek()
        {
            self.pos += 1;
            let args = self.parse_arglist()?;
            return Ok((Term::Compound(name, args), 0));
        }
        if !quoted {
            if let Some((prec, assoc)) = prefix_op(&name) {
                if prec <= max && self.starts_term() {
                    let arg_max = if assoc == Assoc::Fy { prec } else { prec - 1 };
                    let (arg, _) = self.parse(arg_max)?;
                    return Ok((Term::Compound(name, vec![arg]), prec));
                }
            }
        }
        Ok((Term::Atom(name), 0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read(text: &str) -> Term {
        parse_term(text).unwrap().term
    }

    #[test]
    fn reads_compound_with_list() {
        let parsed = parse_term("chord_tones(c, major, X)").unwrap();
        assert_eq!(parsed.var_names, vec!["X".to_string()]);
        assert_eq!(parsed.term.to_canonical_named(&parsed.var_names), "chord_tones(c,major,X)");
    }

    #[test]
    fn reads_operators_with_precedence() {
        let t = read("X is 1 + 2 * 3");
        assert_eq!(t.to_canonical(), "is(_G0,+(1,*(2,3)))");
        let t = read("a :- b, c ; d");
        assert_eq!(t.to_canonical(), ":-(a,;(','(b,c),d))");
        let t = read("a - b - c");
        assert_eq!(t.to_canonical(), "-(-(a,b),c)");
    }

    #[test]
    fn reads_negative_numbers_and_prefix_minus() {
        assert_eq!(read("f(-1, - 1, -a)").to_canonical(), "f(-1,-(1),-(a))");
        assert_eq!(read("X - 1").to_canonical(), "-(_G0,1)");
        assert_eq!(read("-2.5"), Term::Float(-2.5));
    }

    #[test]
    fn reads_integer_extremes() {
        assert_eq!(read("-9223372036854775808"), Term::Int(i64::MIN));
        assert_eq!(read("9223372036854775807"), Term::Int(i64::MAX));
        assert_eq!(read("X is -9223372036854775808").to_canonical(), "is(_G0,-9223372036854775808)");
        assert!(parse_term("9223372036854775808").is_err());
        assert!(parse_term("-9223372036854775809").is_err());
        assert!(parse_term("- 9223372036854775808").is_err());
    }

    #[test]
    fn reads_namespaced_terms() {
        let t = read("fx:reverb(0.3)");
        assert_eq!(t.to_canonical(), ":(fx,reverb(0.3))");
    }

    #[test]
    fn reads_operator_atoms_as_arguments() {
        assert_eq!(read("f(+, -, [=<])").to_canonical(), "f(+,-,[=<])");
        assert_eq!(read("\\+ member(x, L)").to_canonical(), "\\+(member(x,_G0))");
    }

    #[test]
    fn canonical_text_reads_back_identically() {
        let texts = [
            "action(set_tempo(120),0.9,[because(genre_house)])",
            "f('Upper','with space',\"str\",[a|T],{x},'it\\'s')",
            "','(a,b)",
            ":-(h,','(b,c))",
        ];
        for text in texts {
            let first = parse_term(text).unwrap();
            let written = first.term.to_canonical();
            let second = parse_term(&written).unwrap();
            assert_eq!(first.term, second.term, "{text} -> {written}");
        }
    }

    #[test]
    fn anonymous_variables_are_distinct() {
        let parsed = parse_term("p(_, _, X, X)").unwrap();
        assert_eq!(parsed.var_names.len(), 3);
        assert_eq!(parsed.term.to_canonical(), "p(_G0,_G1,_G2,_G2)");
    }

    #[test]
    fn reads_program_with_comments_and_directives() {
        let program = parse_program(
            "% theory\n:- dynamic seen/1.\nnote(c). /* block */ note(d).\nscale(major, [c,d,e]).\n",
        )
        .unwrap();
        assert_eq!(program.len(), 4);
        assert_eq!(program[0].term.to_canonical(), ":-(dynamic(/(seen,1)))");
    }

    #[test]
    fn reports_syntax_errors_with_position() {
        let err = parse_term("foo(a,").unwrap_err();
        let InterpreterError::Syntax { message } = err else {
            panic!("expected syntax error");
        };
        assert!(message.contains("line 1"));

        assert!(parse_program("a(1)\nb(2).").is_err());
        assert!(parse_term("f(a))").is_err());
    }

    #[test]
    fn reads_character_codes_and_radix() {
        assert_eq!(read("0'a"), Term::Int(97));
        assert_eq!(read("0xff"), Term::Int(255));
        assert_eq!(read("1.5e3"), Term::Float(1500.0));
    }

    #[test]
    fn trailing_period_is_optional_for_single_terms() {
        assert_eq!(read("a(1)."), read("a(1)"));
    }
}
