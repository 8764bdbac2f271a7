use std::fs;
use std::process::Command;

use ipca::ipca::RunConfig;
use tempfile::tempdir;

const RUN_FILE: &str = r#"
[model]
features = 8
components = 2
block_width = 4

[run]
workers = 3
output_dir = "fit"
initialize = true

[data]
kind = "csv"
path = "observations.csv"
"#;

fn write_observations(dir: &std::path::Path) {
    let mut rows = String::new();
    for j in 0..20 {
        let fields: Vec<String> = (0..8)
            .map(|i| format!("{:.3}", ((i * 7 + j * 3) % 11) as f64 * 0.5 + i as f64))
            .collect();
        rows.push_str(&fields.join(","));
        rows.push('\n');
    }
    fs::write(dir.join("observations.csv"), rows).expect("write observations");
}

#[test]
fn run_subcommand_writes_outputs_into_the_configured_directory() {
    let tmp = tempdir().expect("temporary directory");
    write_observations(tmp.path());
    let config_path = tmp.path().join("run.toml");
    fs::write(&config_path, RUN_FILE).expect("write run file");

    let exe = env!("CARGO_BIN_EXE_ipca");
    let output = Command::new(exe)
        .current_dir(tmp.path())
        .args(["run", "--config", "run.toml", "--workers", "2"])
        .output()
        .expect("run ipca cli");

    assert!(output.status.success(), "CLI failed: {output:?}");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Fitted 2 components from 20 observations"));

    let fit = tmp.path().join("fit");
    for name in ["basis.csv", "spectrum.csv", "moments.csv", "timings.csv"] {
        assert!(fit.join(name).exists(), "{name} missing");
    }
    let copied = RunConfig::load(&fit.join("run.toml")).expect("copied config");
    assert_eq!(copied.run.workers, 2);

    let moments = fs::read_to_string(fit.join("moments.csv")).expect("moments");
    assert_eq!(moments.lines().count(), 9);
}

#[test]
fn invalid_configuration_exits_with_failure() {
    let tmp = tempdir().expect("temporary directory");
    let broken = RUN_FILE.replace("components = 2", "components = 9");
    fs::write(tmp.path().join("run.toml"), broken).expect("write run file");

    let status = Command::new(env!("CARGO_BIN_EXE_ipca"))
        .current_dir(tmp.path())
        .args(["run", "--config", "run.toml"])
        .status()
        .expect("run ipca cli");
    assert_eq!(status.code(), Some(1));
}

#[test]
fn partition_subcommand_lists_every_rank() {
    let output = Command::new(env!("CARGO_BIN_EXE_ipca"))
        .args(["partition", "--features", "10", "--workers", "4"])
        .output()
        .expect("run ipca cli");

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.starts_with("10 features over 4 workers"));
    assert_eq!(stdout.lines().count(), 5);
}
