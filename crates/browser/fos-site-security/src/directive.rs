//! Directive Parser
//!
//! Parses Strict-Transport-Security (RFC 6797) and Public-Key-Pins
//! (RFC 7469) header values into a [`PolicyUpdate`].
//!
//! Header text comes from untrusted peers, so any problem rejects the whole
//! header and nothing is applied.

use crate::PolicyKind;
use crate::pin::SpkiHash;

/// Minimum number of distinct pins a Public-Key-Pins header must carry
pub const MIN_HEADER_PINS: usize = 2;

/// Parsed policy update
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyUpdate {
    pub max_age_seconds: u64,
    pub include_subdomains: bool,
    /// Distinct pin-sha256 values in header order (HPKP only)
    pub pins: Vec<SpkiHash>,
    pub report_uri: Option<String>,
}

impl PolicyUpdate {
    /// `max-age=0` removes the existing record
    pub fn is_removal(&self) -> bool {
        self.max_age_seconds == 0
    }
}

/// Reason a header was rejected
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DirectiveError {
    #[error("Syntax error: {0}")]
    Syntax(String),

    #[error("Missing max-age directive")]
    MissingMaxAge,

    #[error("Invalid max-age value: {0}")]
    InvalidMaxAge(String),

    #[error("Directive appears more than once: {0}")]
    Duplicate(&'static str),

    #[error("Directive {0} does not take a value")]
    UnexpectedValue(&'static str),

    #[error("Invalid pin-sha256 value: {0}")]
    InvalidPin(String),

    #[error("Not enough pins: {found} (need at least 2)")]
    NotEnoughPins { found: usize },
}

/// One `name[=value]` directive
#[derive(Debug, Clone, PartialEq, Eq)]
struct Directive {
    name: String,
    value: Option<String>,
}

/// Parse a header value for the given policy kind
pub fn parse(kind: PolicyKind, header: &str) -> Result<PolicyUpdate, DirectiveError> {
    let directives = tokenize(header)?;

    let mut max_age = None;
    let mut include_subdomains = false;
    let mut report_uri = None;
    let mut pins: Vec<SpkiHash> = Vec::new();

    for directive in directives {
        match directive.name.as_str() {
            "max-age" => {
                if max_age.is_some() {
                    return Err(DirectiveError::Duplicate("max-age"));
                }
                max_age = Some(parse_max_age(directive.value.as_deref())?);
            }
            "includesubdomains" => {
                if include_subdomains {
                    return Err(DirectiveError::Duplicate("includeSubDomains"));
                }
                if directive.value.is_some() {
                    return Err(DirectiveError::UnexpectedValue("includeSubDomains"));
                }
                include_subdomains = true;
            }
            "pin-sha256" if kind == PolicyKind::Hpkp => {
                let value = directive.value.unwrap_or_default();
                let hash = SpkiHash::from_base64(&value)
                    .ok_or(DirectiveError::InvalidPin(value))?;
                if !pins.contains(&hash) {
                    pins.push(hash);
                }
            }
            "report-uri" if kind == PolicyKind::Hpkp => {
                if report_uri.is_some() {
                    return Err(DirectiveError::Duplicate("report-uri"));
                }
                let value = directive
                    .value
                    .ok_or_else(|| DirectiveError::Syntax("report-uri needs a value".into()))?;
                report_uri = Some(value);
            }
            // Unknown directives are ignored for forward compatibility.
            _ => {}
        }
    }

    let max_age_seconds = max_age.ok_or(DirectiveError::MissingMaxAge)?;
    if kind == PolicyKind::Hpkp && max_age_seconds != 0 && pins.len() < MIN_HEADER_PINS {
        return Err(DirectiveError::NotEnoughPins { found: pins.len() });
    }

    Ok(PolicyUpdate {
        max_age_seconds,
        include_subdomains,
        pins,
        report_uri,
    })
}

fn parse_max_age(value: Option<&str>) -> Result<u64, DirectiveError> {
    let value = value.ok_or_else(|| DirectiveError::InvalidMaxAge(String::new()))?;
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return Err(DirectiveError::InvalidMaxAge(value.to_string()));
    }
    value
        .parse::<u64>()
        .map_err(|_| DirectiveError::InvalidMaxAge(value.to_string()))
}

/// Split a header into directives
///
/// directive = name [ "=" ( token / quoted-string ) ], separated by ";".
/// Names are lowercased; quoted values are unescaped.
fn tokenize(header: &str) -> Result<Vec<Directive>, DirectiveError> {
    let mut directives = Vec::new();
    let mut chars = header.chars().peekable();

    loop {
        skip_whitespace(&mut chars);
        match chars.peek() {
            None => break,
            Some(';') => {
                chars.next();
                continue;
            }
            Some(_) => {}
        }

        let name = take_token(&mut chars);
        if name.is_empty() {
            let c = chars.peek().copied().unwrap_or_default();
            return Err(DirectiveError::Syntax(format!("unexpected character {c:?}")));
        }
        skip_whitespace(&mut chars);

        let mut value = None;
        if chars.peek() == Some(&'=') {
            chars.next();
            skip_whitespace(&mut chars);
            if chars.peek() == Some(&'"') {
                chars.next();
                value = Some(take_quoted(&mut chars)?);
            } else {
                value = Some(take_token(&mut chars));
            }
            skip_whitespace(&mut chars);
        }

        match chars.next() {
            None | Some(';') => {}
            Some(c) => {
                return Err(DirectiveError::Syntax(format!(
                    "unexpected character {c:?} after {name}"
                )));
            }
        }

        directives.push(Directive {
            name: name.to_ascii_lowercase(),
            value,
        });
    }

    Ok(directives)
}

fn skip_whitespace(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) {
    while chars.next_if(|c| *c == ' ' || *c == '\t').is_some() {}
}

fn take_token(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> String {
    let mut token = String::new();
    while let Some(c) = chars.next_if(|c| is_token_char(*c)) {
        token.push(c);
    }
    token
}

fn take_quoted(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> Result<String, DirectiveError> {
    let mut value = String::new();
    loop {
        match chars.next() {
            Some('"') => return Ok(value),
            Some('\\') => match chars.next() {
                Some(c) => value.push(c),
                None => break,
            },
            Some(c) if c.is_control() && c != '\t' => {
                return Err(DirectiveError::Syntax("control character in quoted string".into()));
            }
            Some(c) => value.push(c),
            None => break,
        }
    }
    Err(DirectiveError::Syntax("unterminated quoted string".into()))
}

/// RFC 7230 tchar
fn is_token_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || "!#$%&'*+-.^_`|~".contains(c)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PIN_A: &str = "VCIlmPM9NkgFQtrs4Oa5TeFcDu6MWRTKSNdePEhOgD8=";
    const PIN_B: &str = "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=";

    #[test]
    fn test_hsts_basic() {
        let update = parse(PolicyKind::Hsts, "max-age=69403").unwrap();
        assert_eq!(update.max_age_seconds, 69403);
        assert!(!update.include_subdomains);
        assert!(update.pins.is_empty());
    }

    #[test]
    fn test_hsts_case_and_whitespace() {
        let update = parse(PolicyKind::Hsts, "  Max-Age = 10 ;\tINCLUDESUBDOMAINS ; ").unwrap();
        assert_eq!(update.max_age_seconds, 10);
        assert!(update.include_subdomains);
    }

    #[test]
    fn test_quoted_max_age() {
        let update = parse(PolicyKind::Hsts, "max-age=\"300\"").unwrap();
        assert_eq!(update.max_age_seconds, 300);
    }

    #[test]
    fn test_max_age_zero_is_removal() {
        let update = parse(PolicyKind::Hsts, "max-age=0").unwrap();
        assert!(update.is_removal());
        // Removal needs no pins
        assert!(parse(PolicyKind::Hpkp, "max-age=0").unwrap().is_removal());
    }

    #[test]
    fn test_bad_max_age() {
        for header in ["max-age=-1", "max-age=1.5", "max-age=abc", "max-age=", "max-age",
                       "max-age=99999999999999999999999"] {
            assert!(matches!(parse(PolicyKind::Hsts, header), Err(DirectiveError::InvalidMaxAge(_))), "{header}");
        }
        assert_eq!(parse(PolicyKind::Hsts, "includeSubDomains"), Err(DirectiveError::MissingMaxAge));
        assert_eq!(parse(PolicyKind::Hsts, ""), Err(DirectiveError::MissingMaxAge));
    }

    #[test]
    fn test_duplicates() {
        assert_eq!(parse(PolicyKind::Hsts, "max-age=1; max-age=2"), Err(DirectiveError::Duplicate("max-age")));
        assert_eq!(
            parse(PolicyKind::Hsts, "max-age=1; includeSubDomains; includesubdomains"),
            Err(DirectiveError::Duplicate("includeSubDomains"))
        );
        assert_eq!(
            parse(PolicyKind::Hsts, "max-age=1; includeSubDomains=yes"),
            Err(DirectiveError::UnexpectedValue("includeSubDomains"))
        );
        let header = format!(
            "max-age=1; pin-sha256=\"{PIN_A}\"; pin-sha256=\"{PIN_B}\"; report-uri=\"a\"; report-uri=\"b\""
        );
        assert_eq!(parse(PolicyKind::Hpkp, &header), Err(DirectiveError::Duplicate("report-uri")));
        // report-uri means nothing to HSTS
        assert!(parse(PolicyKind::Hsts, "max-age=1; report-uri=\"a\"; report-uri=\"b\"").is_ok());
    }

    #[test]
    fn test_unknown_directives_ignored() {
        let update = parse(PolicyKind::Hsts, "max-age=5; preload; future=\"x;y\"").unwrap();
        assert_eq!(update.max_age_seconds, 5);
    }

    #[test]
    fn test_syntax_errors() {
        assert!(matches!(parse(PolicyKind::Hsts, "max-age=5 junk"), Err(DirectiveError::Syntax(_))));
        assert!(matches!(parse(PolicyKind::Hsts, "max-age=\"5"), Err(DirectiveError::Syntax(_))));
        assert!(matches!(parse(PolicyKind::Hsts, "=5"), Err(DirectiveError::Syntax(_))));
    }

    #[test]
    fn test_hpkp_pins() {
        let header = format!("max-age=69403; pin-sha256=\"{PIN_A}\"; pin-sha256=\"{PIN_B}\"; report-uri=\"https://r.example/\"");
        let update = parse(PolicyKind::Hpkp, &header).unwrap();
        assert_eq!(update.pins.len(), 2);
        assert_eq!(update.pins[0].to_base64(), PIN_A);
        assert_eq!(update.report_uri.as_deref(), Some("https://r.example/"));
    }

    #[test]
    fn test_hpkp_trailing_semicolons() {
        let header = format!("max-age=69403;pin-sha256=\"{PIN_A}\";pin-sha256=\"{PIN_B}\";");
        assert_eq!(parse(PolicyKind::Hpkp, &header).unwrap().pins.len(), 2);
    }

    #[test]
    fn test_hpkp_not_enough_pins() {
        let header = format!("max-age=100; pin-sha256=\"{PIN_A}\"; pin-sha256=\"{PIN_A}\"");
        assert_eq!(parse(PolicyKind::Hpkp, &header), Err(DirectiveError::NotEnoughPins { found: 1 }));
    }

    #[test]
    fn test_hpkp_bad_pin() {
        let header = format!("max-age=100; pin-sha256=\"{PIN_A}\"; pin-sha256=\"AAAA\"");
        assert!(matches!(parse(PolicyKind::Hpkp, &header), Err(DirectiveError::InvalidPin(_))));
    }

    #[test]
    fn test_pins_ignored_for_hsts() {
        let header = format!("max-age=100; pin-sha256=\"{PIN_A}\"");
        assert!(parse(PolicyKind::Hsts, &header).unwrap().pins.is_empty());
    }
}
