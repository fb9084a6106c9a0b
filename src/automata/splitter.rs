/// Rule-body tokenizer: splits an ABNF-like element string into a typed
/// nested token list for the compiler.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SplitError {
    #[error("unterminated quoted string in `{0}`")]
    UnterminatedQuote(String),
    #[error("unterminated `{open}` group in `{body}`")]
    UnterminatedGroup { open: char, body: String },
    #[error("repetition prefix `{0}` has no target")]
    DanglingRepetition(String),
}

/// One token of a rule body.
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    /// A bare identifier or a quoted literal (quotes retained).
    Atom(String),
    /// A standalone `/` alternation marker.
    Alt,
    /// A parenthesized group, recursively split.
    Group(Vec<Token>),
    /// A bracketed optional group, recursively split.
    Optional(Vec<Token>),
    /// A repetition prefix (`N`, `N*`, `*N`, `*`, `N*M`) and its target.
    Repeat(String, Box<Token>),
}

/// Tokenize a rule body on whitespace, keeping quoted spans, groups, and
/// optional groups atomic, emitting `/` alone, and pairing a leading
/// digit/`*` run with the token or group it repeats.
pub fn split_into_tokens(body: &str) -> Result<Vec<Token>, SplitError> {
    let chars: Vec<char> = body.chars().collect();
    let mut tokens: Vec<Token> = Vec::new();
    let mut pending_rep: Option<String> = None;
    let mut buf = String::new();
    let mut i = 0;

    let flush = |buf: &mut String,
                     pending_rep: &mut Option<String>,
                     tokens: &mut Vec<Token>|
     -> Result<(), SplitError> {
        if buf.is_empty() {
            if let Some(rep) = pending_rep.take() {
                return Err(SplitError::DanglingRepetition(rep));
            }
            return Ok(());
        }
        let token = Token::Atom(std::mem::take(buf));
        match pending_rep.take() {
            Some(rep) => tokens.push(Token::Repeat(rep, Box::new(token))),
            None => tokens.push(token),
        }
        Ok(())
    };

    while i < chars.len() {
        let c = chars[i];

        if c == ' ' {
            flush(&mut buf, &mut pending_rep, &mut tokens)?;
            i += 1;
            continue;
        }

        // Quoted strings can contain anything up to the matching quote.
        if c == '"' {
            buf.push(c);
            i += 1;
            loop {
                match chars.get(i) {
                    Some('"') => {
                        buf.push('"');
                        i += 1;
                        break;
                    }
                    Some(&ch) => {
                        buf.push(ch);
                        i += 1;
                    }
                    None => return Err(SplitError::UnterminatedQuote(body.to_string())),
                }
            }
            continue;
        }

        // A digit or `*` at token start is a repetition prefix; it attaches
        // to whatever token or group comes next.
        if buf.is_empty() && pending_rep.is_none() && (c == '*' || c.is_ascii_digit()) {
            let mut rep = String::new();
            while let Some(&ch) = chars.get(i) {
                if ch == '*' || ch.is_ascii_digit() {
                    rep.push(ch);
                    i += 1;
                } else {
                    break;
                }
            }
            pending_rep = Some(rep);
            continue;
        }

        // Alternation always stands alone.
        if c == '/' {
            flush(&mut buf, &mut pending_rep, &mut tokens)?;
            tokens.push(Token::Alt);
            i += 1;
            continue;
        }

        // Groups recurse; brackets additionally mark the group optional.
        if c == '(' || c == '[' {
            let close = if c == '(' { ')' } else { ']' };
            let mut depth = 1;
            let mut quoted = false;
            let start = i + 1;
            let mut j = start;
            while j < chars.len() {
                let ch = chars[j];
                if ch == '"' {
                    quoted = !quoted;
                } else if !quoted {
                    if ch == c {
                        depth += 1;
                    } else if ch == close {
                        depth -= 1;
                        if depth == 0 {
                            break;
                        }
                    }
                }
                j += 1;
            }
            if depth != 0 {
                return Err(SplitError::UnterminatedGroup {
                    open: c,
                    body: body.to_string(),
                });
            }
            let inner: String = chars[start..j].iter().collect();
            let sub_tokens = split_into_tokens(&inner)?;
            let group = if c == '(' {
                Token::Group(sub_tokens)
            } else {
                Token::Optional(sub_tokens)
            };
            match pending_rep.take() {
                Some(rep) => tokens.push(Token::Repeat(rep, Box::new(group))),
                None => tokens.push(group),
            }
            i = j + 1;
            continue;
        }

        buf.push(c);
        i += 1;
    }

    flush(&mut buf, &mut pending_rep, &mut tokens)?;
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn atom(s: &str) -> Token {
        Token::Atom(s.to_string())
    }

    #[test]
    fn splits_bare_words() {
        assert_eq!(
            split_into_tokens("abc def ghi").unwrap(),
            vec![atom("abc"), atom("def"), atom("ghi")]
        );
    }

    #[test]
    fn quoted_strings_keep_spaces_and_quotes() {
        assert_eq!(
            split_into_tokens("\"two words\" tail").unwrap(),
            vec![atom("\"two words\""), atom("tail")]
        );
    }

    #[test]
    fn repetition_prefix_pairs_with_atom() {
        assert_eq!(
            split_into_tokens("abc 2\"def\"").unwrap(),
            vec![
                atom("abc"),
                Token::Repeat("2".to_string(), Box::new(atom("\"def\"")))
            ]
        );
        assert_eq!(
            split_into_tokens("3*8 def").unwrap(),
            vec![Token::Repeat("3*8".to_string(), Box::new(atom("def")))]
        );
        assert_eq!(
            split_into_tokens("*\"x\"").unwrap(),
            vec![Token::Repeat("*".to_string(), Box::new(atom("\"x\"")))]
        );
    }

    #[test]
    fn repetition_prefix_pairs_with_group() {
        assert_eq!(
            split_into_tokens("5(\"a\"/\"bc\"/\"def\")").unwrap(),
            vec![Token::Repeat(
                "5".to_string(),
                Box::new(Token::Group(vec![
                    atom("\"a\""),
                    Token::Alt,
                    atom("\"bc\""),
                    Token::Alt,
                    atom("\"def\"")
                ]))
            )]
        );
    }

    #[test]
    fn alternation_is_standalone() {
        assert_eq!(
            split_into_tokens("a / b").unwrap(),
            vec![atom("a"), Token::Alt, atom("b")]
        );
        assert_eq!(
            split_into_tokens("a/b").unwrap(),
            vec![atom("a"), Token::Alt, atom("b")]
        );
    }

    #[test]
    fn optional_group() {
        assert_eq!(
            split_into_tokens("[\"maybe\"] yes").unwrap(),
            vec![
                Token::Optional(vec![atom("\"maybe\"")]),
                atom("yes")
            ]
        );
    }

    #[test]
    fn nested_groups() {
        assert_eq!(
            split_into_tokens("(a (b / c))").unwrap(),
            vec![Token::Group(vec![
                atom("a"),
                Token::Group(vec![atom("b"), Token::Alt, atom("c")])
            ])]
        );
    }

    #[test]
    fn unterminated_quote_errors() {
        assert!(matches!(
            split_into_tokens("\"oops"),
            Err(SplitError::UnterminatedQuote(_))
        ));
    }

    #[test]
    fn unterminated_group_errors() {
        assert!(matches!(
            split_into_tokens("(a b"),
            Err(SplitError::UnterminatedGroup { .. })
        ));
    }

    #[test]
    fn dangling_repetition_errors() {
        assert!(matches!(
            split_into_tokens("abc 3*"),
            Err(SplitError::DanglingRepetition(_))
        ));
    }
}
