//! `loadstage init` command implementation.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Starter config: ramp to 10 VUs, hold, ramp down, over a mixed
/// health/read/write workload.
const DEFAULT_TEMPLATE: &str = r#"# Load test configuration for loadstage
#
# Run with:  loadstage run --url http://localhost:3000
# (or set TARGET_URL in the environment or a .env file)

[settings]
# Pause between iterations of one virtual user, picked uniformly in [min, max]
think_time = ["1s", "3s"]

# Per-request timeout
timeout = "30s"

# Time given to in-flight iterations once the run stops
graceful_stop = "30s"

# Percentiles shown for every trend in the summary
percentiles = [90, 95, 99]

# Optional global iteration limit; the first of duration/iterations wins
# iterations = 1000

# Ramp up to 10 virtual users, hold, then ramp down.
# Replace the [[stage]] blocks with `vus = 10` and `duration = "1m"` under
# [settings] for a constant load.

[[stage]]
duration = "2m"
target = 10

[[stage]]
duration = "5m"
target = 10

[[stage]]
duration = "2m"
target = 0

# Each iteration picks one scenario with probability `weight` (weights sum to 1.0).

[[scenario]]
name = "health"
weight = 0.3
path = "/health"
error_metric = "errors"
trend_metric = "health_check_latency"
checks = [
  { name = "health check status is 200", type = "status", expect = 200 },
  { name = "health check response time < 500ms", type = "max_duration_ms", limit = 500 },
  { name = "health check has correct status", type = "json_equals", pointer = "/status", value = "healthy" },
]

[[scenario]]
name = "get data"
weight = 0.3
path = "/data"
error_metric = "errors"
checks = [
  { name = "get data status is 200", type = "status", expect = 200 },
  { name = "get data returns array", type = "json_is_array", pointer = "/data" },
]

[[scenario]]
name = "post data"
weight = 0.4
method = "POST"
path = "/data"
# One payload is picked per iteration; `stamp_field` gets the current time appended
payloads = [
  { name = "Alice Johnson", message = "Load testing" },
  { name = "Bob Smith", message = "Testing database performance" },
  { name = "Carol White", message = "Concurrent write test" },
]
stamp_field = "message"
error_metric = "errors"
trend_metric = "db_insert_latency"
checks = [
  { name = "post data status is 201", type = "status", expect = 201 },
]

# Thresholds decide the exit status: 0 when all pass, 99 otherwise.
[thresholds]
http_req_duration = ["p(95)<2000"]
http_req_failed = ["rate<0.05"]
errors = ["rate<0.1"]
"#;

/// Execute the `init` command.
///
/// Creates `<dir>/.loadstage/loadtest.toml` and returns its path.
pub fn execute_init(dir: &Path, force: bool) -> Result<PathBuf> {
    let config_dir = dir.join(".loadstage");
    let config_path = config_dir.join("loadtest.toml");

    if config_path.exists() && !force {
        anyhow::bail!(
            "Config file already exists: {}\n\
             Use `--force` to overwrite.",
            config_path.display()
        );
    }

    std::fs::create_dir_all(&config_dir)
        .with_context(|| format!("Failed to create {}", config_dir.display()))?;
    std::fs::write(&config_path, DEFAULT_TEMPLATE)
        .with_context(|| format!("Failed to write {}", config_path.display()))?;

    eprintln!("Created {}", config_path.display());
    eprintln!("Edit the file to customize your load test scenario.");
    Ok(config_path)
}
