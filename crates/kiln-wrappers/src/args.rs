//! Command-line utilities: shell-style token splitting and response-file
//! expansion.

use std::fs;

/// Split one line into arguments the way a shell would: whitespace separates
/// tokens, single and double quotes group, backslash escapes the next
/// character (except inside single quotes).
pub fn split_command_line(line: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut has_token = false;
    let mut quote: Option<char> = None;
    let mut escaped = false;

    for c in line.chars() {
        if escaped {
            current.push(c);
            escaped = false;
        } else if c == '\\' && quote != Some('\'') {
            escaped = true;
            has_token = true;
        } else if let Some(q) = quote {
            if c == q {
                quote = None;
            } else {
                current.push(c);
            }
        } else if c == '\'' || c == '"' {
            quote = Some(c);
            has_token = true;
        } else if c.is_whitespace() {
            if has_token {
                out.push(std::mem::take(&mut current));
                has_token = false;
            }
        } else {
            current.push(c);
            has_token = true;
        }
    }
    if has_token {
        out.push(current);
    }

    out
}

/// Expand `@response-file` arguments recursively.
///
/// An unreadable response file is left as-is — that is what GCC itself does,
/// and the compiler will produce the authoritative error message.
pub fn expand_response_files(args: &[String]) -> Vec<String> {
    let mut out = Vec::new();
    for arg in args {
        match arg.strip_prefix('@') {
            Some(path) => match fs::read_to_string(path) {
                Ok(content) => {
                    let mut nested = Vec::new();
                    for line in content.lines() {
                        nested.extend(split_command_line(line));
                    }
                    out.extend(expand_response_files(&nested));
                }
                Err(_) => out.push(arg.clone()),
            },
            None => out.push(arg.clone()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn splits_on_whitespace() {
        assert_eq!(split_command_line("-O2  -c foo.c"), strings(&["-O2", "-c", "foo.c"]));
    }

    #[test]
    fn quotes_group_tokens() {
        assert_eq!(
            split_command_line(r#"-DMSG="hello world" 'a b'"#),
            strings(&["-DMSG=hello world", "a b"])
        );
    }

    #[test]
    fn backslash_escapes_spaces() {
        assert_eq!(
            split_command_line(r"path\ with\ spaces -c"),
            strings(&["path with spaces", "-c"])
        );
    }

    #[test]
    fn empty_quoted_token_is_kept() {
        assert_eq!(split_command_line(r#"a "" b"#), strings(&["a", "", "b"]));
    }

    #[test]
    fn expands_response_files_recursively() {
        let tmp = tempfile::tempdir().unwrap();
        let inner = tmp.path().join("inner.rsp");
        fs::write(&inner, "-DINNER=1\n").unwrap();
        let outer = tmp.path().join("outer.rsp");
        fs::write(
            &outer,
            format!("-O2 -c\n@{}\nmain.c", inner.display()),
        )
        .unwrap();

        let args = vec!["cc".to_string(), format!("@{}", outer.display())];
        assert_eq!(
            expand_response_files(&args),
            strings(&["cc", "-O2", "-c", "-DINNER=1", "main.c"])
        );
    }

    #[test]
    fn unreadable_response_file_is_left_alone() {
        let args = strings(&["cc", "@/no/such/file.rsp"]);
        assert_eq!(expand_response_files(&args), args);
    }
}
