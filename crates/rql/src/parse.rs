//! Recursive-descent parser for the URL query mini-language.
//!
//! Grammar, loosely:
//!
//! ```text
//! query   := arg ('&' arg)*
//! call    := IDENT '(' [ arg (',' arg)* ] ')'
//! arg     := call | '+' IDENT | '-' IDENT | literal | IDENT
//! literal := STRING | NUMBER | 'true' | 'false' | 'null'
//! ```
//!
//! Multiple `&`-joined clauses become a single `and` node. A signed
//! identifier (only meaningful inside `sort`) becomes an `asc`/`desc`
//! node wrapping the bind. Strings are quoted with `'` or `"`; a quote
//! is escaped by doubling it.

use super::{Expr, Value};

#[derive(Debug, thiserror::Error, PartialEq)]
#[error("query parse error at byte {at}: {message}")]
pub struct ParseError {
    pub at: usize,
    pub message: String,
}

pub fn parse(input: &str) -> Result<Expr, ParseError> {
    let mut parser = Parser { input, pos: 0 };
    parser.skip_ws();
    let mut clauses = vec![parser.arg()?];
    parser.skip_ws();
    while parser.eat('&') {
        parser.skip_ws();
        clauses.push(parser.arg()?);
        parser.skip_ws();
    }
    if parser.pos != parser.input.len() {
        return Err(parser.error("trailing input"));
    }
    if clauses.len() == 1 {
        Ok(clauses.pop().unwrap())
    } else {
        Ok(Expr::op("and", clauses))
    }
}

struct Parser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn error(&self, message: impl Into<String>) -> ParseError {
        ParseError {
            at: self.pos,
            message: message.into(),
        }
    }

    fn rest(&self) -> &'a str {
        &self.input[self.pos..]
    }

    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn eat(&mut self, want: char) -> bool {
        if self.peek() == Some(want) {
            self.pos += want.len_utf8();
            true
        } else {
            false
        }
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_whitespace()) {
            self.pos += 1;
        }
    }

    /// `IDENT '(' args ')'`. The identifier alone (no parens) is a bind.
    fn call(&mut self) -> Result<Expr, ParseError> {
        let name = self.ident()?;
        self.skip_ws();
        if !self.eat('(') {
            return Ok(Expr::Bind(name));
        }
        let mut args = Vec::new();
        self.skip_ws();
        if !self.eat(')') {
            loop {
                args.push(self.arg()?);
                self.skip_ws();
                if self.eat(',') {
                    self.skip_ws();
                    continue;
                }
                if self.eat(')') {
                    break;
                }
                return Err(self.error("expected ',' or ')'"));
            }
        }
        Ok(Expr::Op { name, args })
    }

    fn arg(&mut self) -> Result<Expr, ParseError> {
        match self.peek() {
            None => Err(self.error("unexpected end of input")),
            Some('\'') | Some('"') => self.string(),
            Some('+') => {
                self.pos += 1;
                Ok(Expr::op("asc", vec![Expr::Bind(self.ident()?)]))
            }
            Some('-') => {
                self.pos += 1;
                match self.peek() {
                    Some(c) if c.is_ascii_digit() => self.number(true),
                    _ => Ok(Expr::op("desc", vec![Expr::Bind(self.ident()?)])),
                }
            }
            Some(c) if c.is_ascii_digit() => self.number(false),
            Some(c) if is_ident_start(c) => {
                let start = self.pos;
                let name = self.ident()?;
                self.skip_ws();
                if self.peek() == Some('(') {
                    self.pos = start;
                    return self.call();
                }
                Ok(match name.as_str() {
                    "true" => Expr::Value(Value::Bool(true)),
                    "false" => Expr::Value(Value::Bool(false)),
                    "null" => Expr::Value(Value::Null),
                    _ => Expr::Bind(name),
                })
            }
            Some(c) => Err(self.error(format!("unexpected character {c:?}"))),
        }
    }

    /// Dotted identifier: `code`, `notes.note`, `_id`.
    fn ident(&mut self) -> Result<String, ParseError> {
        let start = self.pos;
        let mut seen = false;
        while let Some(c) = self.peek() {
            if is_ident_start(c) || c.is_ascii_digit() || (seen && c == '.') {
                self.pos += c.len_utf8();
                seen = true;
            } else {
                break;
            }
        }
        if !seen {
            return Err(self.error("expected identifier"));
        }
        let ident = &self.input[start..self.pos];
        if ident.ends_with('.') {
            return Err(self.error("identifier may not end with '.'"));
        }
        Ok(ident.to_string())
    }

    fn number(&mut self, negative: bool) -> Result<Expr, ParseError> {
        let start = self.pos;
        let mut is_float = false;
        while let Some(c) = self.peek() {
            match c {
                '0'..='9' => self.pos += 1,
                '.' | 'e' | 'E' => {
                    is_float = true;
                    self.pos += 1;
                }
                '+' | '-' if is_float => self.pos += 1,
                _ => break,
            }
        }
        let text = &self.input[start..self.pos];
        if is_float {
            let n: f64 = text
                .parse()
                .map_err(|_| self.error(format!("bad number {text:?}")))?;
            Ok(Expr::Value(Value::Number(if negative { -n } else { n })))
        } else {
            let n: i64 = text
                .parse()
                .map_err(|_| self.error(format!("bad number {text:?}")))?;
            Ok(Expr::Value(Value::Integer(if negative { -n } else { n })))
        }
    }

    fn string(&mut self) -> Result<Expr, ParseError> {
        let quote = self.peek().unwrap();
        self.pos += 1;
        let mut out = String::new();
        loop {
            match self.peek() {
                None => return Err(self.error("unterminated string")),
                Some(c) if c == quote => {
                    self.pos += 1;
                    // A doubled quote is a literal quote.
                    if self.peek() == Some(quote) {
                        self.pos += 1;
                        out.push(quote);
                        continue;
                    }
                    return Ok(Expr::Value(Value::String(out)));
                }
                Some(c) => {
                    self.pos += c.len_utf8();
                    out.push(c);
                }
            }
        }
    }
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_' || c == ':'
}

#[cfg(test)]
mod test {
    use super::super::unparse;
    use super::*;
    use pretty_assertions::assert_eq;

    fn roundtrip(input: &str) -> String {
        unparse(&parse(input).unwrap())
    }

    #[test]
    fn test_parse_simple() {
        assert_eq!(
            parse("eq(code,'lt')").unwrap(),
            Expr::op("eq", vec![Expr::bind("code"), Expr::string("lt")]),
        );
    }

    #[test]
    fn test_parse_clauses_join_into_and() {
        let expr = parse("eq(code,'lt')&sort(+name)&limit(10)").unwrap();
        assert_eq!(
            unparse(&expr),
            "and(eq(code,'lt'),sort(+name),limit(10))",
        );
    }

    #[test]
    fn test_parse_sort_directions() {
        let expr = parse("sort(+code,-title,place)").unwrap();
        assert_eq!(unparse(&expr), "sort(+code,-title,place)");
    }

    #[test]
    fn test_parse_literals() {
        assert_eq!(roundtrip("eq(a,null)"), "eq(a,null)");
        assert_eq!(roundtrip("eq(a,true)"), "eq(a,true)");
        assert_eq!(roundtrip("eq(a,-7)"), "eq(a,-7)");
        assert_eq!(roundtrip("eq(a,3.5)"), "eq(a,3.5)");
        assert_eq!(roundtrip(r#"eq(a,"x")"#), "eq(a,'x')");
    }

    #[test]
    fn test_parse_dotted_bind_and_nested_call() {
        assert_eq!(
            roundtrip("eq(notes.note,'x')&select(code,count())"),
            "and(eq(notes.note,'x'),select(code,count()))",
        );
    }

    #[test]
    fn test_parse_quote_escape() {
        let expr = parse("eq(title,'it''s')").unwrap();
        assert_eq!(
            expr,
            Expr::op("eq", vec![Expr::bind("title"), Expr::string("it's")]),
        );
        // Unparse escapes it back.
        assert_eq!(unparse(&expr), "eq(title,'it''s')");
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse("").is_err());
        assert!(parse("eq(a,").is_err());
        assert!(parse("eq(a,'unterminated").is_err());
        assert!(parse("eq(a,1) trailing").is_err());
        assert!(parse("eq(a.,1)").is_err());
    }
}
