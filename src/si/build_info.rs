use chrono::TimeZone as _;

pub fn build_host() -> &'static str {
    option_env!("SVCINIT_BUILD_HOST").unwrap_or("unknown")
}

pub fn build_time_raw() -> &'static str {
    option_env!("SVCINIT_BUILD_TIME").unwrap_or("unknown")
}

pub fn build_time_pretty() -> String {
    format_build_time_pretty(build_time_raw())
}

const PRETTY: &str = "%Y-%m-%d %H:%M:%S";

pub fn format_build_time_pretty(raw: &str) -> String {
    let raw = raw.trim();
    if let Some(epoch) = raw.strip_prefix("epoch:")
        && let Ok(secs) = epoch.trim().parse::<i64>()
    {
        return match chrono::Utc.timestamp_opt(secs, 0).single() {
            Some(dt) => dt.format(PRETTY).to_string(),
            None => format!("epoch {secs}"),
        };
    }

    // "YYYY-MM-DDTHH:MM:SSZ" -> "YYYY-MM-DD HH:MM:SS" (UTC)
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(raw) {
        return dt.with_timezone(&chrono::Utc).format(PRETTY).to_string();
    }

    raw.replace('T', " ").trim_end_matches('Z').to_string()
}

/// Version line for `--version`.
pub fn banner() -> String {
    format!(
        "{} (built on {} at {})",
        env!("CARGO_PKG_VERSION"),
        build_host(),
        build_time_pretty()
    )
}
