use serde::Serialize;

/// Request parameters that select a language variant of a place page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LocaleParams {
    pub hl: &'static str,
    pub gl: &'static str,
    pub accept_language: &'static str,
}

const SUPPORTED: &[(&str, LocaleParams)] = &[
    (
        "en-US",
        LocaleParams {
            hl: "en",
            gl: "us",
            accept_language: "en-US,en;q=0.9",
        },
    ),
    (
        "en-GB",
        LocaleParams {
            hl: "en-GB",
            gl: "gb",
            accept_language: "en-GB,en;q=0.9",
        },
    ),
    (
        "cs-CZ",
        LocaleParams {
            hl: "cs",
            gl: "cz",
            accept_language: "cs-CZ,cs;q=0.9",
        },
    ),
    (
        "sk-SK",
        LocaleParams {
            hl: "sk",
            gl: "sk",
            accept_language: "sk-SK,sk;q=0.9",
        },
    ),
    (
        "de-DE",
        LocaleParams {
            hl: "de",
            gl: "de",
            accept_language: "de-DE,de;q=0.9",
        },
    ),
    (
        "pl-PL",
        LocaleParams {
            hl: "pl",
            gl: "pl",
            accept_language: "pl-PL,pl;q=0.9",
        },
    ),
];

pub fn lookup(locale: &str) -> Option<LocaleParams> {
    SUPPORTED
        .iter()
        .find(|(code, _)| *code == locale)
        .map(|(_, params)| *params)
}

pub fn is_supported(locale: &str) -> bool {
    lookup(locale).is_some()
}

pub fn all() -> Vec<String> {
    SUPPORTED.iter().map(|(code, _)| code.to_string()).collect()
}

/// Keeps supported locales in their original order, dropping duplicates.
pub fn retain_supported<S: AsRef<str>>(locales: &[S]) -> Vec<String> {
    let mut kept: Vec<String> = Vec::new();
    for locale in locales {
        let locale = locale.as_ref().trim();
        if is_supported(locale) && !kept.iter().any(|existing| existing == locale) {
            kept.push(locale.to_string());
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filters_unknown_and_duplicate_locales() {
        let kept = retain_supported(&["cs-CZ", "xx-XX", "en-US", "cs-CZ"]);
        assert_eq!(kept, vec!["cs-CZ".to_string(), "en-US".to_string()]);
    }

    #[test]
    fn resolves_locale_params() {
        let params = lookup("de-DE").unwrap();
        assert_eq!(params.hl, "de");
        assert_eq!(params.gl, "de");
        assert!(lookup("fr-FR").is_none());
    }
}
