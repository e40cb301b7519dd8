use std::iter::Peekable;
use std::str::Chars;

use crate::bail;
use crate::error::{ErrorKind, ShiftResult};

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Token {
    /// A bare word, either a keyword or an unquoted identifier.
    Word(String),
    /// An identifier between backticks.
    QuotedIdent(String),
    StringLit(String),
    Number(String),
    LParen,
    RParen,
    Comma,
    Semicolon,
    Equals,
    Dot,
}

impl Token {
    /// Returns `true` if the token is the bare word `keyword`, ignoring case.
    pub(crate) fn is_keyword(&self, keyword: &str) -> bool {
        matches!(self, Token::Word(word) if word.eq_ignore_ascii_case(keyword))
    }
}

/// Splits `sql` into tokens, dropping whitespace and comments.
pub(crate) fn tokenize(sql: &str) -> ShiftResult<Vec<Token>> {
    let mut chars = sql.chars().peekable();
    let mut tokens = Vec::new();

    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '-' => {
                chars.next();
                match chars.peek() {
                    Some('-') => skip_line(&mut chars),
                    Some(d) if d.is_ascii_digit() => {
                        let mut number = "-".to_owned();
                        read_number(&mut chars, &mut number);
                        tokens.push(Token::Number(number));
                    }
                    _ => bail!(
                        ErrorKind::ValidationError,
                        "Unexpected character in statement",
                        "'-' must start a comment or a negative number"
                    ),
                }
            }
            '#' => skip_line(&mut chars),
            '/' => {
                chars.next();
                if chars.next() != Some('*') {
                    bail!(
                        ErrorKind::ValidationError,
                        "Unexpected character in statement",
                        "'/' must start a comment"
                    );
                }
                skip_block_comment(&mut chars)?;
            }
            '`' => {
                chars.next();
                tokens.push(Token::QuotedIdent(read_quoted(&mut chars, '`')?));
            }
            '\'' | '"' => {
                chars.next();
                tokens.push(Token::StringLit(read_quoted(&mut chars, c)?));
            }
            '(' | ')' | ',' | ';' | '=' | '.' => {
                chars.next();
                tokens.push(match c {
                    '(' => Token::LParen,
                    ')' => Token::RParen,
                    ',' => Token::Comma,
                    ';' => Token::Semicolon,
                    '=' => Token::Equals,
                    _ => Token::Dot,
                });
            }
            c if c.is_ascii_digit() => {
                let mut number = String::new();
                read_number(&mut chars, &mut number);
                tokens.push(Token::Number(number));
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut word = String::new();
                while let Some(&c) = chars.peek() {
                    if !(c.is_alphanumeric() || c == '_' || c == '$') {
                        break;
                    }
                    word.push(c);
                    chars.next();
                }
                tokens.push(Token::Word(word));
            }
            other => bail!(
                ErrorKind::ValidationError,
                "Unexpected character in statement",
                format!("'{other}'")
            ),
        }
    }

    Ok(tokens)
}

fn skip_line(chars: &mut Peekable<Chars<'_>>) {
    for c in chars.by_ref() {
        if c == '\n' {
            break;
        }
    }
}

fn skip_block_comment(chars: &mut Peekable<Chars<'_>>) -> ShiftResult<()> {
    while let Some(c) = chars.next() {
        if c == '*' && chars.peek() == Some(&'/') {
            chars.next();
            return Ok(());
        }
    }

    bail!(
        ErrorKind::ValidationError,
        "Unterminated comment in statement"
    );
}

fn read_number(chars: &mut Peekable<Chars<'_>>, number: &mut String) {
    let mut seen_dot = false;
    while let Some(&c) = chars.peek() {
        if c.is_ascii_digit() || (c == '.' && !seen_dot) {
            seen_dot |= c == '.';
            number.push(c);
            chars.next();
        } else {
            break;
        }
    }
}

/// Reads until the closing `quote`, which is escaped by doubling it. Backslash escapes are
/// honored inside string literals.
fn read_quoted(chars: &mut Peekable<Chars<'_>>, quote: char) -> ShiftResult<String> {
    let mut value = String::new();
    while let Some(c) = chars.next() {
        if c == quote {
            if chars.peek() == Some(&quote) {
                chars.next();
                value.push(quote);
                continue;
            }

            return Ok(value);
        }

        if c == '\\' && quote != '`' {
            match chars.next() {
                Some('n') => value.push('\n'),
                Some('t') => value.push('\t'),
                Some('0') => value.push('\0'),
                Some(escaped) => value.push(escaped),
                None => break,
            }
            continue;
        }

        value.push(c);
    }

    bail!(
        ErrorKind::ValidationError,
        "Unterminated quoted text in statement",
        format!("missing closing {quote}")
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statements_are_tokenized() {
        let tokens =
            tokenize("ALTER TABLE `my``tbl` modify c varchar(64) default 'it''s' -- done").unwrap();

        assert_eq!(
            tokens,
            vec![
                Token::Word("ALTER".to_owned()),
                Token::Word("TABLE".to_owned()),
                Token::QuotedIdent("my`tbl".to_owned()),
                Token::Word("modify".to_owned()),
                Token::Word("c".to_owned()),
                Token::Word("varchar".to_owned()),
                Token::LParen,
                Token::Number("64".to_owned()),
                Token::RParen,
                Token::Word("default".to_owned()),
                Token::StringLit("it's".to_owned()),
            ]
        );
    }

    #[test]
    fn negative_numbers_and_comments() {
        let tokens = tokenize("/* c */ -1.5, 2").unwrap();

        assert_eq!(
            tokens,
            vec![
                Token::Number("-1.5".to_owned()),
                Token::Comma,
                Token::Number("2".to_owned())
            ]
        );
    }

    #[test]
    fn unterminated_strings_are_rejected() {
        let err = tokenize("default 'x").unwrap_err();

        assert_eq!(err.kind(), ErrorKind::ValidationError);
    }
}
