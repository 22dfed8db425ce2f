//! String rendering and printf-style formatting.
//!
//! `to_str` rendering rides the [`Value`] `Display` impl (integers
//! decimal, floats with six fractional digits, bytes as `b"…"`, struct
//! instances as `<Name instance>`). `fmt` implements the specifier set
//! `%s %d %x %X %b %f %.Nf %e %v %t %q` with optional zero-pad flag and
//! width, which is also what f-string `:`-specifiers compile into.

use noxy_core::value::Value;

/// Render a value the way `to_str` does.
pub fn render(value: &Value) -> String {
    value.to_string()
}

struct Spec {
    zero_pad: bool,
    width: Option<usize>,
    precision: Option<usize>,
    verb: char,
}

/// Apply a printf-like format string to `args`.
pub fn format(template: &str, args: &[Value]) -> Result<String, String> {
    let mut out = String::new();
    let mut chars = template.chars().peekable();
    let mut next_arg = 0usize;

    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        if chars.peek() == Some(&'%') {
            chars.next();
            out.push('%');
            continue;
        }

        // %[0][width][.precision]verb
        let mut spec = Spec {
            zero_pad: false,
            width: None,
            precision: None,
            verb: 'v',
        };
        if chars.peek() == Some(&'0') {
            spec.zero_pad = true;
            chars.next();
        }
        let mut width = String::new();
        while chars.peek().is_some_and(|c| c.is_ascii_digit()) {
            width.push(chars.next().expect("peeked digit"));
        }
        if !width.is_empty() {
            spec.width = width.parse().ok();
        }
        if chars.peek() == Some(&'.') {
            chars.next();
            let mut precision = String::new();
            while chars.peek().is_some_and(|c| c.is_ascii_digit()) {
                precision.push(chars.next().expect("peeked digit"));
            }
            spec.precision = Some(
                precision
                    .parse()
                    .map_err(|_| "fmt: missing precision digits".to_string())?,
            );
        }
        spec.verb = chars
            .next()
            .ok_or_else(|| "fmt: dangling '%' in format string".to_string())?;

        let arg = args
            .get(next_arg)
            .ok_or_else(|| format!("fmt: missing argument for %{}", spec.verb))?;
        next_arg += 1;
        out.push_str(&apply(&spec, arg)?);
    }

    Ok(out)
}

fn int_arg(value: &Value, verb: char) -> Result<i64, String> {
    match value {
        Value::Int(n) => Ok(*n),
        Value::Bool(b) => Ok(*b as i64),
        other => Err(format!(
            "fmt: %{} requires an integer, got {}",
            verb,
            other.type_name()
        )),
    }
}

fn float_arg(value: &Value, verb: char) -> Result<f64, String> {
    match value {
        Value::Int(n) => Ok(*n as f64),
        Value::Float(x) => Ok(*x),
        other => Err(format!(
            "fmt: %{} requires a number, got {}",
            verb,
            other.type_name()
        )),
    }
}

fn pad(spec: &Spec, body: String, numeric: bool) -> String {
    let Some(width) = spec.width else {
        return body;
    };
    if body.len() >= width {
        return body;
    }
    let fill = width - body.len();
    if spec.zero_pad && numeric {
        // Keep a leading sign in front of the zeros.
        if let Some(rest) = body.strip_prefix('-') {
            return format!("-{}{}", "0".repeat(fill), rest);
        }
        return format!("{}{}", "0".repeat(fill), body);
    }
    format!("{}{}", " ".repeat(fill), body)
}

fn apply(spec: &Spec, arg: &Value) -> Result<String, String> {
    let body = match spec.verb {
        's' => render(arg),
        'd' => int_arg(arg, 'd')?.to_string(),
        'x' => match arg {
            // Bytes render as their hex encoding, matching the plugin wire.
            Value::Bytes(data) => hex::encode(&*data.lock().expect("bytes lock poisoned")),
            other => format!("{:x}", int_arg(other, 'x')?),
        },
        'X' => match arg {
            Value::Bytes(data) => {
                hex::encode_upper(&*data.lock().expect("bytes lock poisoned"))
            }
            other => format!("{:X}", int_arg(other, 'X')?),
        },
        'b' => format!("{:b}", int_arg(arg, 'b')?),
        'f' => {
            let precision = spec.precision.unwrap_or(6);
            format!("{:.*}", precision, float_arg(arg, 'f')?)
        }
        'e' => format!("{:e}", float_arg(arg, 'e')?),
        'v' => render(arg),
        't' => match arg {
            Value::Bool(b) => b.to_string(),
            other => {
                return Err(format!(
                    "fmt: %t requires a bool, got {}",
                    other.type_name()
                ))
            }
        },
        'q' => {
            let mut quoted = String::from("\"");
            for c in render(arg).chars() {
                match c {
                    '"' => quoted.push_str("\\\""),
                    '\\' => quoted.push_str("\\\\"),
                    '\n' => quoted.push_str("\\n"),
                    '\r' => quoted.push_str("\\r"),
                    '\t' => quoted.push_str("\\t"),
                    other => quoted.push(other),
                }
            }
            quoted.push('"');
            quoted
        }
        other => return Err(format!("fmt: unknown format specifier %{}", other)),
    };
    let numeric = matches!(spec.verb, 'd' | 'x' | 'X' | 'b' | 'f' | 'e' | 'v');
    Ok(pad(spec, body, numeric))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_verbs() {
        assert_eq!(
            format("%s %d %t", &[Value::string("a"), Value::Int(7), Value::Bool(true)]).unwrap(),
            "a 7 true"
        );
    }

    #[test]
    fn test_hex_and_binary() {
        assert_eq!(format("%x", &[Value::Int(255)]).unwrap(), "ff");
        assert_eq!(format("%X", &[Value::Int(255)]).unwrap(), "FF");
        assert_eq!(format("%b", &[Value::Int(5)]).unwrap(), "101");
    }

    #[test]
    fn test_float_precision() {
        assert_eq!(format("%f", &[Value::Float(3.14)]).unwrap(), "3.140000");
        assert_eq!(format("%.2f", &[Value::Float(3.14159)]).unwrap(), "3.14");
        assert_eq!(format("%.0f", &[Value::Float(2.7)]).unwrap(), "3");
    }

    #[test]
    fn test_zero_pad_width() {
        assert_eq!(format("%05d", &[Value::Int(42)]).unwrap(), "00042");
        assert_eq!(format("%05v", &[Value::Int(42)]).unwrap(), "00042");
        assert_eq!(format("%5d", &[Value::Int(42)]).unwrap(), "   42");
        assert_eq!(format("%05d", &[Value::Int(-42)]).unwrap(), "-0042");
    }

    #[test]
    fn test_quote() {
        assert_eq!(
            format("%q", &[Value::string("a\"b\n")]).unwrap(),
            "\"a\\\"b\\n\""
        );
    }

    #[test]
    fn test_percent_escape() {
        assert_eq!(format("100%%", &[]).unwrap(), "100%");
    }

    #[test]
    fn test_missing_argument() {
        assert!(format("%d", &[]).is_err());
    }

    #[test]
    fn test_wrong_type() {
        assert!(format("%d", &[Value::string("x")]).is_err());
    }

    #[test]
    fn test_bytes_hex() {
        assert_eq!(
            format("%x", &[Value::bytes(vec![0xde, 0xad])]).unwrap(),
            "dead"
        );
    }
}
