//! Minimal statement classification for the local engine.
//!
//! DDL is handled against the catalog directly; everything that starts with
//! `SELECT` or `WITH` is handed to Polars SQL unchanged.

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Statement {
    DropTable {
        database: Option<String>,
        table: String,
        if_exists: bool,
    },
    Select(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct ParseError(pub String);

/// Quote an identifier with backticks, doubling embedded backticks.
pub fn backtick(ident: &str) -> String {
    format!("`{}`", ident.replace('`', "``"))
}

/// Quote an identifier with double quotes, doubling embedded quotes.
pub fn double_quote(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

pub fn parse(sql: &str) -> Result<Statement, ParseError> {
    let trimmed = sql.trim().trim_end_matches(';').trim();
    if trimmed.is_empty() {
        return Err(ParseError("empty statement".into()));
    }

    let mut words = trimmed.split_whitespace();
    let first = words.next().unwrap_or_default().to_ascii_uppercase();
    match first.as_str() {
        "SELECT" | "WITH" => Ok(Statement::Select(trimmed.to_string())),
        "DROP" => parse_drop(trimmed),
        other => Err(ParseError(format!("unsupported statement: {other}"))),
    }
}

fn parse_drop(stmt: &str) -> Result<Statement, ParseError> {
    let mut rest = strip_keyword(stmt, "DROP")
        .and_then(|r| strip_keyword(r, "TABLE"))
        .ok_or_else(|| ParseError("expected DROP TABLE".into()))?;

    let mut if_exists = false;
    if let Some(r) = strip_keyword(rest, "IF") {
        rest = strip_keyword(r, "EXISTS").ok_or_else(|| ParseError("expected IF EXISTS".into()))?;
        if_exists = true;
    }

    let parts = parse_qualified_name(rest.trim())?;
    let (database, table) = match parts.as_slice() {
        [table] => (None, table.clone()),
        [db, table] => (Some(db.clone()), table.clone()),
        _ => return Err(ParseError(format!("invalid table name: {}", rest.trim()))),
    };

    Ok(Statement::DropTable {
        database,
        table,
        if_exists,
    })
}

/// Unqualified names of the relations a query reads: the identifier after
/// each `FROM` or `JOIN`, first occurrence order. Subqueries contribute
/// their own `FROM`s; names that are not tables (CTEs) are left for the
/// caller to ignore.
pub fn referenced_tables(query: &str) -> Vec<String> {
    let tokens = tokenize(query);
    let mut names: Vec<String> = Vec::new();
    let mut i = 0;
    while i < tokens.len() {
        let is_source = matches!(
            &tokens[i],
            Token::Word(w) if w.eq_ignore_ascii_case("FROM") || w.eq_ignore_ascii_case("JOIN")
        );
        i += 1;
        if !is_source {
            continue;
        }

        let mut last = None;
        while let Some(Token::Word(part) | Token::Quoted(part)) = tokens.get(i) {
            last = Some(part.clone());
            i += 1;
            if tokens.get(i) == Some(&Token::Dot) {
                i += 1;
            } else {
                break;
            }
        }
        if let Some(name) = last {
            if !names.contains(&name) {
                names.push(name);
            }
        }
    }
    names
}

#[derive(Debug, PartialEq, Eq)]
enum Token {
    Word(String),
    Quoted(String),
    Dot,
    Other,
}

fn tokenize(sql: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut chars = sql.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            c if c.is_whitespace() => {}
            '.' => tokens.push(Token::Dot),
            '\'' => {
                while let Some(n) = chars.next() {
                    if n == '\'' {
                        if chars.peek() == Some(&'\'') {
                            chars.next();
                        } else {
                            break;
                        }
                    }
                }
                tokens.push(Token::Other);
            }
            q @ ('"' | '`') => {
                let mut ident = String::new();
                while let Some(n) = chars.next() {
                    if n != q {
                        ident.push(n);
                    } else if chars.peek() == Some(&q) {
                        chars.next();
                        ident.push(q);
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Quoted(ident));
            }
            c if c.is_alphanumeric() || c == '_' => {
                let mut word = String::from(c);
                while let Some(&n) = chars.peek() {
                    if !(n.is_alphanumeric() || n == '_') {
                        break;
                    }
                    word.push(n);
                    chars.next();
                }
                tokens.push(Token::Word(word));
            }
            _ => tokens.push(Token::Other),
        }
    }
    tokens
}

/// Strip a leading case-insensitive keyword followed by whitespace or end.
fn strip_keyword<'a>(s: &'a str, keyword: &str) -> Option<&'a str> {
    let s = s.trim_start();
    let head = s.get(..keyword.len())?;
    if !head.eq_ignore_ascii_case(keyword) {
        return None;
    }
    let rest = &s[keyword.len()..];
    if rest.is_empty() || rest.starts_with(char::is_whitespace) {
        Some(rest)
    } else {
        None
    }
}

/// Split `a.b` where each part may be bare, backtick- or double-quoted.
fn parse_qualified_name(s: &str) -> Result<Vec<String>, ParseError> {
    let mut parts = Vec::new();
    let mut chars = s.chars().peekable();

    loop {
        let mut part = String::new();
        match chars.peek().copied() {
            Some(q @ ('`' | '"')) => {
                chars.next();
                loop {
                    match chars.next() {
                        Some(c) if c == q => {
                            if chars.peek() == Some(&q) {
                                chars.next();
                                part.push(q);
                            } else {
                                break;
                            }
                        }
                        Some(c) => part.push(c),
                        None => return Err(ParseError(format!("unterminated identifier in {s}"))),
                    }
                }
            }
            Some(_) => {
                while let Some(&c) = chars.peek() {
                    if c == '.' || c.is_whitespace() {
                        break;
                    }
                    part.push(c);
                    chars.next();
                }
            }
            None => return Err(ParseError("missing table name".into())),
        }

        if part.is_empty() {
            return Err(ParseError(format!("empty identifier in {s}")));
        }
        parts.push(part);

        match chars.next() {
            Some('.') => continue,
            None => break,
            Some(c) if c.is_whitespace() && chars.all(char::is_whitespace) => break,
            Some(_) => return Err(ParseError(format!("unexpected input after table name: {s}"))),
        }
    }

    Ok(parts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_qualified_drop_if_exists() {
        let stmt = parse("DROP TABLE IF EXISTS `financial_data_db`.`structured_fd`;").unwrap();
        assert_eq!(
            stmt,
            Statement::DropTable {
                database: Some("financial_data_db".into()),
                table: "structured_fd".into(),
                if_exists: true,
            }
        );
    }

    #[test]
    fn parses_bare_drop() {
        let stmt = parse("drop table quotes").unwrap();
        assert_eq!(
            stmt,
            Statement::DropTable {
                database: None,
                table: "quotes".into(),
                if_exists: false,
            }
        );
    }

    #[test]
    fn quoted_names_may_contain_dots_and_quotes() {
        let stmt = parse(&format!("DROP TABLE {}", backtick("odd.na`me"))).unwrap();
        assert!(matches!(stmt, Statement::DropTable { ref table, .. } if table == "odd.na`me"));
    }

    #[test]
    fn select_passes_through_without_semicolon() {
        let stmt = parse("  SELECT COUNT(*) FROM t WHERE low < 0;  ").unwrap();
        assert_eq!(
            stmt,
            Statement::Select("SELECT COUNT(*) FROM t WHERE low < 0".into())
        );
    }

    #[test]
    fn finds_tables_after_from_and_join() {
        assert_eq!(
            referenced_tables(r#"SELECT COUNT(*) AS n FROM "quotes" WHERE low < 0"#),
            vec!["quotes"]
        );
        assert_eq!(
            referenced_tables(
                "select * from db.a join `b` on a.x = b.x where a.y in (select y from c)"
            ),
            vec!["a", "b", "c"]
        );
    }

    #[test]
    fn ignores_keywords_inside_literals() {
        assert_eq!(
            referenced_tables("SELECT 'from nowhere' AS s FROM t WHERE note = 'join x'"),
            vec!["t"]
        );
    }

    #[test]
    fn rejects_unsupported_and_malformed() {
        assert!(parse("INSERT INTO t VALUES (1)").is_err());
        assert!(parse("DROP TABLE").is_err());
        assert!(parse("DROP TABLE a.b.c").is_err());
        assert!(parse("DROP TABLE `unterminated").is_err());
        assert!(parse("   ").is_err());
    }
}
