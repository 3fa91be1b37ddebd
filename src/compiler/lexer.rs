use crate::compiler::CompileError;

/// One lexical token inside an argument field.
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    /// Bare identifier (instruction names, function names).
    Word(String),
    Num(f64),
    /// `"..."` string literal, quotes stripped.
    Str(String),
    /// `{identifier}` pixel literal, braces stripped.
    Pixel(String),
    /// `<name>` variable reference.
    Var(String),
    /// `<name[expr]>` array access; the index is its own token stream.
    Index(String, Vec<Token>),
    /// `(...)` parenthesized subexpression.
    Group(Vec<Token>),
    Op(&'static str),
}

const TWO_CHAR_OPS: [&str; 8] = ["<=", ">=", "==", "!=", "&&", "||", "~>", "~<"];
const ROUND_OP: &str = "~=";

/// Split one source line into whitespace-delimited argument fields. Strings,
/// pixel literals, bracketed variables, and parenthesized subexpressions keep
/// internal whitespace; a `//` outside any of those starts a comment.
pub fn split_fields(line: &str, line_no: usize) -> Result<Vec<String>, CompileError> {
    let bytes: Vec<char> = line.chars().collect();
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut depth_paren = 0usize;
    let mut in_string = false;
    let mut in_angle = false;
    let mut in_brace = false;
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i];
        if in_string {
            current.push(c);
            if c == '"' {
                in_string = false;
            }
            i += 1;
            continue;
        }
        if in_brace {
            current.push(c);
            if c == '}' {
                in_brace = false;
            }
            i += 1;
            continue;
        }
        match c {
            '"' => {
                in_string = true;
                current.push(c);
            }
            '{' => {
                in_brace = true;
                current.push(c);
            }
            '(' => {
                depth_paren += 1;
                current.push(c);
            }
            ')' => {
                if depth_paren == 0 {
                    return Err(CompileError::syntax(line_no, "unmatched ')'"));
                }
                depth_paren -= 1;
                current.push(c);
            }
            '<' => {
                // `<` opens a bracketed variable only when immediately
                // followed by an identifier character; otherwise it is the
                // comparison operator.
                if !in_angle
                    && i + 1 < bytes.len()
                    && (bytes[i + 1].is_alphanumeric() || bytes[i + 1] == '_')
                    && angle_closes(&bytes, i)
                {
                    in_angle = true;
                }
                current.push(c);
            }
            '>' => {
                if in_angle {
                    in_angle = false;
                }
                current.push(c);
            }
            '/' if depth_paren == 0
                && !in_angle
                && i + 1 < bytes.len()
                && bytes[i + 1] == '/' =>
            {
                break;
            }
            c if c.is_whitespace() && depth_paren == 0 && !in_angle => {
                if !current.is_empty() {
                    fields.push(std::mem::take(&mut current));
                }
            }
            _ => current.push(c),
        }
        i += 1;
    }

    if in_string {
        return Err(CompileError::syntax(line_no, "unterminated string"));
    }
    if in_brace {
        return Err(CompileError::syntax(line_no, "unterminated pixel literal"));
    }
    if depth_paren > 0 {
        return Err(CompileError::syntax(line_no, "unmatched '('"));
    }
    if !current.is_empty() {
        fields.push(current);
    }
    Ok(fields)
}

/// Whether the `<` at `start` is closed by a matching `>` before whitespace
/// that is not inside an index bracket.
fn angle_closes(chars: &[char], start: usize) -> bool {
    let mut depth_bracket = 0usize;
    for &c in &chars[start + 1..] {
        match c {
            '[' => depth_bracket += 1,
            ']' => depth_bracket = depth_bracket.saturating_sub(1),
            '>' if depth_bracket == 0 => return true,
            c if c.is_alphanumeric() || c == '_' => {}
            _ if depth_bracket > 0 => {}
            _ => return false,
        }
    }
    false
}

/// Tokenize one argument field.
pub fn lex_field(field: &str, line_no: usize) -> Result<Vec<Token>, CompileError> {
    let chars: Vec<char> = field.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        match c {
            '"' => {
                let mut text = String::new();
                i += 1;
                while i < chars.len() && chars[i] != '"' {
                    text.push(chars[i]);
                    i += 1;
                }
                if i >= chars.len() {
                    return Err(CompileError::syntax(line_no, "unterminated string"));
                }
                i += 1;
                tokens.push(Token::Str(text));
            }
            '{' => {
                let mut text = String::new();
                i += 1;
                while i < chars.len() && chars[i] != '}' {
                    text.push(chars[i]);
                    i += 1;
                }
                if i >= chars.len() {
                    return Err(CompileError::syntax(line_no, "unterminated pixel literal"));
                }
                i += 1;
                tokens.push(Token::Pixel(text));
            }
            '(' => {
                let (inner, consumed) = balanced(&chars, i, '(', ')', line_no)?;
                tokens.push(Token::Group(lex_field(&inner, line_no)?));
                i += consumed;
            }
            '<' => {
                // two-char comparison first, then variable, then bare `<`
                if i + 1 < chars.len() && chars[i + 1] == '=' {
                    tokens.push(Token::Op("<="));
                    i += 2;
                } else if i + 1 < chars.len()
                    && (chars[i + 1].is_alphanumeric() || chars[i + 1] == '_')
                    && angle_closes(&chars, i)
                {
                    let (token, consumed) = lex_variable(&chars, i, line_no)?;
                    tokens.push(token);
                    i += consumed;
                } else {
                    tokens.push(Token::Op("<"));
                    i += 1;
                }
            }
            _ => {
                if let Some(op) = match_two_char_op(&chars, i) {
                    tokens.push(Token::Op(op));
                    i += 2;
                } else if let Some(op) = match_one_char_op(c) {
                    tokens.push(Token::Op(op));
                    i += 1;
                } else if c.is_ascii_digit()
                    || (c == '.' && i + 1 < chars.len() && chars[i + 1].is_ascii_digit())
                {
                    let start = i;
                    while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                        i += 1;
                    }
                    let text: String = chars[start..i].iter().collect();
                    let value: f64 = text
                        .parse()
                        .map_err(|_| CompileError::syntax(line_no, format!("bad number '{text}'")))?;
                    tokens.push(Token::Num(value));
                } else if c.is_alphanumeric() || c == '_' {
                    let start = i;
                    while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                        i += 1;
                    }
                    tokens.push(Token::Word(chars[start..i].iter().collect()));
                } else {
                    return Err(CompileError::syntax(
                        line_no,
                        format!("unexpected character '{c}'"),
                    ));
                }
            }
        }
    }
    Ok(tokens)
}

fn match_two_char_op(chars: &[char], i: usize) -> Option<&'static str> {
    if i + 1 >= chars.len() {
        return None;
    }
    let pair: String = chars[i..i + 2].iter().collect();
    if pair == ROUND_OP {
        return Some("~=");
    }
    TWO_CHAR_OPS.iter().copied().find(|op| *op == pair)
}

fn match_one_char_op(c: char) -> Option<&'static str> {
    match c {
        '+' => Some("+"),
        '-' => Some("-"),
        '*' => Some("*"),
        '/' => Some("/"),
        '%' => Some("%"),
        '^' => Some("^"),
        '>' => Some(">"),
        '!' => Some("!"),
        _ => None,
    }
}

fn lex_variable(
    chars: &[char],
    start: usize,
    line_no: usize,
) -> Result<(Token, usize), CompileError> {
    let mut i = start + 1;
    let mut name = String::new();
    while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
        name.push(chars[i]);
        i += 1;
    }
    if name.is_empty() {
        return Err(CompileError::syntax(line_no, "empty variable name"));
    }
    if i < chars.len() && chars[i] == '[' {
        let (inner, consumed) = balanced(chars, i, '[', ']', line_no)?;
        i += consumed;
        if i >= chars.len() || chars[i] != '>' {
            return Err(CompileError::syntax(
                line_no,
                format!("unterminated variable '<{name}[...]'"),
            ));
        }
        let index = lex_field(&inner, line_no)?;
        return Ok((Token::Index(name, index), i + 1 - start));
    }
    if i >= chars.len() || chars[i] != '>' {
        return Err(CompileError::syntax(
            line_no,
            format!("unterminated variable '<{name}'"),
        ));
    }
    Ok((Token::Var(name), i + 1 - start))
}

/// Scan a balanced `open`..`close` region starting at `start` (which holds
/// `open`); returns the inner text and the total characters consumed.
fn balanced(
    chars: &[char],
    start: usize,
    open: char,
    close: char,
    line_no: usize,
) -> Result<(String, usize), CompileError> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut inner = String::new();
    for (offset, &c) in chars[start..].iter().enumerate() {
        if in_string {
            if c == '"' {
                in_string = false;
            }
            inner.push(c);
            continue;
        }
        if c == '"' {
            in_string = true;
            inner.push(c);
            continue;
        }
        if c == open {
            depth += 1;
            if depth > 1 {
                inner.push(c);
            }
            continue;
        }
        if c == close {
            depth -= 1;
            if depth == 0 {
                return Ok((inner, offset + 1));
            }
            inner.push(c);
            continue;
        }
        if depth > 0 {
            inner.push(c);
        }
    }
    Err(CompileError::syntax(
        line_no,
        format!("unmatched '{open}'"),
    ))
}
