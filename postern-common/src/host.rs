/// Used when the system hostname is empty or not valid UTF-8.
const FALLBACK: &str = "[127.0.0.1]";

/// The system hostname, as announced in EHLO and to cluster peers.
pub fn hostname() -> String {
    gethostname::gethostname()
        .to_str()
        .filter(|name| !name.is_empty())
        .map_or_else(|| FALLBACK.to_string(), str::to_string)
}
