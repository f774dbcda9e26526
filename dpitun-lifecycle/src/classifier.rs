//! Classification of engine output into lifecycle signals.
//!
//! `classify` is pure: the same line always yields the same event, and no
//! state is carried between lines.

use std::sync::LazyLock;

use regex::Regex;

/// Colour escapes emitted by the engine's logger.
static ANSI_ESCAPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1b\[[0-9;]*m").expect("valid ANSI regex"));

/// Timestamped structured-log lines (`INF 2024-...`).
static STRUCTURED_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:DBG|INF|WRN|ERR)\s+\d{4}-").expect("valid prefix regex"));

/// Internal diagnostics, banner fragments and UUID-looking tokens.
static INTERNAL_NOISE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r"(?i)\[(?:PROXY|DNS|HTTPS|CACHE)\]",
        r"|method:\s*CONNECT|cache (?:miss|hit)|resolving|routing|resolution took",
        r"|new conn|client sent hello|shouldExploit|useSystemDns|fragmentation",
        r"|conn established|writing chunked|caching \d+ records",
        r"|[a-f0-9]{8}-[a-f0-9]{8}",
        r"|d88|Y88|88P|level=|ctrl \+ c|listen_addr|dns_addr|github\.com|spoofdpi",
    ))
    .expect("valid noise regex")
});

const READY_MARKERS: &[&str] = &["listening on", "created a listener", "server started"];

/// Phrases that put a line in socket-binding context. The last entry is the
/// Turkish Windows wording for "socket address". Ready markers are checked
/// first, so "created a listener" never lands here.
const BIND_MARKERS: &[&str] = &["bind", "listener", "usage", "socket address", "yuva adresi"];

/// Keywords that turn a bind-context line into a fatal conflict. Windows
/// reports the conflict as "only one usage of each socket address is normally
/// permitted", localized as "... kullanımına izin veriliyor".
const FAILURE_MARKERS: &[&str] = &[
    "error",
    "fail",
    "fatal",
    "ftl",
    "already in use",
    "normally permitted",
    "izin veriliyor",
];

const MIN_ALPHA_CHARS: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// The engine claims to accept connections.
    Ready { line: String },
    /// The engine mentions its listen socket. Only `fatal` conflicts trigger a
    /// port change.
    BindConflict { line: String, fatal: bool },
    /// A failure unrelated to binding.
    GenericError { line: String },
    /// Anything else. Invisible noise is dropped from user-facing output.
    Noise { line: String, visible: bool },
}

/// Remove terminal colour escapes.
pub fn strip_ansi(line: &str) -> std::borrow::Cow<'_, str> {
    ANSI_ESCAPE.replace_all(line, "")
}

pub fn classify(raw: &str) -> LifecycleEvent {
    let line = strip_ansi(raw).into_owned();
    let trimmed = line.trim();

    if is_dropped(&line, trimmed) {
        return LifecycleEvent::Noise {
            line,
            visible: false,
        };
    }

    let lower = line.to_lowercase();
    let contains_any = |markers: &[&str]| markers.iter().any(|m| lower.contains(m));

    if contains_any(READY_MARKERS) {
        return LifecycleEvent::Ready { line };
    }

    let failure = contains_any(FAILURE_MARKERS);
    if contains_any(BIND_MARKERS) {
        return LifecycleEvent::BindConflict {
            line,
            fatal: failure,
        };
    }
    if failure {
        return LifecycleEvent::GenericError { line };
    }

    LifecycleEvent::Noise {
        line,
        visible: true,
    }
}

fn is_dropped(line: &str, trimmed: &str) -> bool {
    if trimmed.is_empty() {
        return true;
    }
    if STRUCTURED_PREFIX.is_match(trimmed) || line.contains("888") || INTERNAL_NOISE.is_match(line)
    {
        return true;
    }
    let alpha = line.chars().filter(|c| c.is_alphabetic()).count();
    alpha < MIN_ALPHA_CHARS && trimmed.chars().count() > 3
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dropped(line: &str) -> bool {
        matches!(classify(line), LifecycleEvent::Noise { visible: false, .. })
    }

    fn ready(line: &str) -> bool {
        matches!(classify(line), LifecycleEvent::Ready { .. })
    }

    fn fatal_conflict(line: &str) -> bool {
        matches!(
            classify(line),
            LifecycleEvent::BindConflict { fatal: true, .. }
        )
    }

    #[test]
    fn ready_markers() {
        assert!(ready("listening on :8080"));
        assert!(ready("Created a listener on 127.0.0.1:8080"));
        assert!(ready("Server started successfully"));
    }

    #[test]
    fn address_in_use_is_fatal_conflict() {
        let event = classify("bind: address already in use");
        assert_eq!(
            event,
            LifecycleEvent::BindConflict {
                line: "bind: address already in use".to_string(),
                fatal: true,
            }
        );
    }

    #[test]
    fn windows_socket_conflicts_are_fatal() {
        assert!(fatal_conflict(
            "Only one usage of each socket address (protocol/network address/port) is normally permitted."
        ));
        assert!(fatal_conflict(
            "Her yuva adresinin yalnızca bir kullanımına izin veriliyor."
        ));
    }

    #[test]
    fn listener_failures_are_fatal_conflicts() {
        assert!(fatal_conflict("failed to create listener: error"));
        assert!(fatal_conflict("FTL listener setup failed on 127.0.0.1:8080"));
        assert!(ready("created a listener on 127.0.0.1:8080"));
    }

    #[test]
    fn bind_mention_without_failure_is_not_fatal() {
        assert_eq!(
            classify("Usage of flags follows below"),
            LifecycleEvent::BindConflict {
                line: "Usage of flags follows below".to_string(),
                fatal: false,
            }
        );
    }

    #[test]
    fn failure_without_bind_context_is_generic() {
        assert!(matches!(
            classify("failed to resolve upstream handshake"),
            LifecycleEvent::GenericError { .. }
        ));
    }

    #[test]
    fn noise_is_dropped() {
        assert!(dropped(""));
        assert!(dropped("   "));
        assert!(dropped("INF 2024-05-01 12:00:00 listening on :8080"));
        assert!(dropped("[CACHE] cache miss for example.com"));
        assert!(dropped("8888888 banner"));
        assert!(dropped("d88P  Y88b"));
        assert!(dropped("request 0f3a9b1c-12ab34cd completed"));
        assert!(dropped("-- 12 --"));
    }

    #[test]
    fn short_lines_survive_alpha_filter() {
        // Three characters or fewer are never treated as banner noise.
        assert_eq!(
            classify("ok"),
            LifecycleEvent::Noise {
                line: "ok".to_string(),
                visible: true,
            }
        );
    }

    #[test]
    fn ansi_is_stripped_before_matching() {
        let event = classify("\x1b[32mlistening on\x1b[0m :8080");
        assert_eq!(
            event,
            LifecycleEvent::Ready {
                line: "listening on :8080".to_string(),
            }
        );
    }

    #[test]
    fn ordinary_output_is_visible_noise() {
        assert_eq!(
            classify("initializing engine"),
            LifecycleEvent::Noise {
                line: "initializing engine".to_string(),
                visible: true,
            }
        );
    }

    #[test]
    fn classification_is_deterministic() {
        let line = "FTL listen tcp :8080: bind: address already in use";
        assert_eq!(classify(line), classify(line));
        assert!(fatal_conflict(line));
    }
}
