//! Statement tokenizer
//!
//! Splits SQL text into statements made of flat lexeme lists. Comments and
//! whitespace are dropped, keywords are lower-cased and every other lexeme
//! is passed through verbatim.

use nom::{
    branch::alt,
    bytes::complete::{tag, take_until, take_while, take_while1},
    character::complete::{anychar, char, digit1, multispace1, not_line_ending},
    combinator::{map, opt, recognize, rest, value},
    sequence::{pair, tuple},
    IResult,
};

/// Words that are lower-cased by the tokenizer.
const KEYWORDS: &[&str] = &[
    "alter",
    "concurrently",
    "create",
    "domain",
    "drop",
    "exists",
    "function",
    "if",
    "index",
    "not",
    "on",
    "only",
    "procedure",
    "sequence",
    "table",
    "trigger",
    "type",
    "unique",
    "view",
];

/// A single SQL statement as a list of lexemes. The terminating
/// semicolon, when present, is the last lexeme.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Statement(pub Vec<String>);

impl Statement {
    pub fn lexemes(&self) -> &[String] {
        &self.0
    }
}

#[cfg(test)]
impl<const N: usize> From<[&str; N]> for Statement {
    fn from(lexemes: [&str; N]) -> Self {
        Statement(lexemes.iter().map(|s| s.to_string()).collect())
    }
}

/// Positional helpers used when matching a statement against the DDL grammar.
pub(crate) trait Lexemes {
    /// The lexeme at position `i`, or an empty string past the end.
    fn lexeme(&self, i: usize) -> &str;

    /// Reports whether the list begins with all of `prefix`.
    fn begins_with(&self, prefix: &[&str]) -> bool;

    /// Removes `prefix` from the front of the list if it is present.
    fn skip_prefix(&self, prefix: &[&str]) -> &Self;
}

impl Lexemes for [String] {
    fn lexeme(&self, i: usize) -> &str {
        self.get(i).map(String::as_str).unwrap_or("")
    }

    fn begins_with(&self, prefix: &[&str]) -> bool {
        self.len() >= prefix.len() && self.iter().zip(prefix).all(|(a, b)| a == b)
    }

    fn skip_prefix(&self, prefix: &[&str]) -> &Self {
        if self.begins_with(prefix) {
            &self[prefix.len()..]
        } else {
            self
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Token<'a> {
    Skip,
    Word(&'a str),
    Text(&'a str),
}

/// Tokenize `sql` into statements separated by semicolons.
///
/// A trailing statement without a semicolon is still returned. The
/// tokenizer never fails; anything it does not recognise becomes a
/// single-character lexeme.
pub fn statements(sql: &str) -> Vec<Statement> {
    let mut stmts = Vec::new();
    let mut current: Vec<String> = Vec::new();
    let mut input = sql;

    while !input.is_empty() {
        let Ok((remaining, tok)) = token(input) else {
            break;
        };
        input = remaining;

        let lexeme = match tok {
            Token::Skip => continue,
            Token::Word(word) => {
                let lower = word.to_ascii_lowercase();
                if KEYWORDS.contains(&lower.as_str()) {
                    lower
                } else {
                    word.to_string()
                }
            }
            Token::Text(text) => text.to_string(),
        };

        let terminator = lexeme == ";";
        current.push(lexeme);
        if terminator {
            stmts.push(Statement(std::mem::take(&mut current)));
        }
    }

    if !current.is_empty() {
        stmts.push(Statement(current));
    }

    stmts
}

fn token(input: &str) -> IResult<&str, Token<'_>> {
    alt((
        value(Token::Skip, multispace1),
        value(Token::Skip, line_comment),
        value(Token::Skip, block_comment),
        map(word, Token::Word),
        map(
            alt((
                dollar_quoted,
                quoted('\''),
                quoted('"'),
                quoted('`'),
                number,
                recognize(anychar),
            )),
            Token::Text,
        ),
    ))(input)
}

fn line_comment(input: &str) -> IResult<&str, &str> {
    recognize(pair(tag("--"), not_line_ending))(input)
}

/// `/* ... */`; an unterminated comment runs to the end of the input.
fn block_comment(input: &str) -> IResult<&str, &str> {
    recognize(tuple((
        tag("/*"),
        alt((take_until("*/"), rest)),
        opt(tag("*/")),
    )))(input)
}

fn word(input: &str) -> IResult<&str, &str> {
    recognize(pair(
        take_while1(|c: char| c.is_alphabetic() || c == '_'),
        take_while(|c: char| c.is_alphanumeric() || c == '_' || c == '$'),
    ))(input)
}

fn number(input: &str) -> IResult<&str, &str> {
    recognize(pair(digit1, opt(pair(char('.'), digit1))))(input)
}

/// A string literal or quoted identifier. A doubled quote character is an
/// escaped quote; an unterminated literal runs to the end of the input.
fn quoted(quote: char) -> impl Fn(&str) -> IResult<&str, &str> {
    move |input: &str| {
        let (body, _) = char(quote)(input)?;
        let offset = input.len() - body.len();
        let mut chars = body.char_indices().peekable();
        while let Some((idx, c)) = chars.next() {
            if c != quote {
                continue;
            }
            if matches!(chars.peek(), Some((_, next)) if *next == quote) {
                chars.next();
                continue;
            }
            let end = offset + idx + c.len_utf8();
            return Ok((&input[end..], &input[..end]));
        }
        Ok(("", input))
    }
}

/// PostgreSQL dollar quoting: `$$ ... $$` or `$tag$ ... $tag$`.
fn dollar_quoted(input: &str) -> IResult<&str, &str> {
    let (body, opener) = recognize(tuple((
        char('$'),
        take_while(|c: char| c.is_alphanumeric() || c == '_'),
        char('$'),
    )))(input)?;

    let end = match body.find(opener) {
        Some(pos) => input.len() - body.len() + pos + opener.len(),
        None => input.len(),
    };
    Ok((&input[end..], &input[..end]))
}
