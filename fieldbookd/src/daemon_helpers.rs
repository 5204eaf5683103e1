fn expand_with_home(value: &str, home: &Path) -> PathBuf {
    if value == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = value.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(value)
}

fn read_u64_var<F>(lookup: &F, name: &str, default: u64) -> u64
where
    F: Fn(&str) -> Option<String>,
{
    lookup(name)
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

fn format_unix(secs: i64) -> String {
    OffsetDateTime::from_unix_timestamp(secs)
        .ok()
        .and_then(|at| at.format(&Rfc3339).ok())
        .unwrap_or_else(|| secs.to_string())
}

async fn render_status_report(queue: &ActionQueue, db_path: &Path) -> anyhow::Result<String> {
    let store = queue.store();
    let pending = queue.pending().await?;
    let blocked: Vec<_> = pending
        .iter()
        .filter(|action| action.status.is_blocked())
        .collect();
    let retrying = pending
        .iter()
        .filter(|action| !action.status.is_blocked() && action.attempt > 0)
        .count();

    let mut out = String::new();
    out.push_str(&format!("store: {}\n", db_path.display()));
    out.push_str(&format!(
        "schema: {} (expected {})\n",
        store.schema_version().await?,
        store::expected_schema_version()
    ));
    out.push_str(&format!("device: {}\n", store.device_id()));
    out.push_str(&format!("pending: {}\n", pending.len()));
    out.push_str(&format!("retrying: {retrying}\n"));
    out.push_str(&format!("needs attention: {}\n", blocked.len()));
    for action in blocked {
        out.push_str(&format!(
            "  [{}] {} queued {}\n",
            action.status,
            action.describe(),
            format_unix(action.created_at)
        ));
    }
    if let Some(oldest) = pending.first() {
        out.push_str(&format!("oldest: {}\n", format_unix(oldest.created_at)));
    }
    Ok(out)
}
