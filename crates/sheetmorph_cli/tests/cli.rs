use std::fs;
use std::path::{Path, PathBuf};

use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;

fn fixtures_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("..")
        .join("sheetmorph")
        .join("tests")
        .join("fixtures")
}

fn write_file(root: &Path, rel: &str, content: &str) -> PathBuf {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("create parent dir");
    }
    fs::write(&path, content).expect("write file");
    path
}

fn load_json(path: &Path) -> serde_json::Value {
    let json = fs::read_to_string(path)
        .unwrap_or_else(|_| panic!("failed to read {}", path.display()));
    serde_json::from_str(&json)
        .unwrap_or_else(|_| panic!("invalid json: {}", path.display()))
}

#[test]
fn sheets_prints_aggregated_document() {
    let mut cmd = cargo_bin_cmd!("sheetmorph");
    cmd.arg("sheets")
        .arg("-f")
        .arg(fixtures_dir().join("gamebus"))
        .arg("-s")
        .arg("property")
        .arg("unit");

    let output = cmd.assert().success().get_output().stdout.clone();
    let printed: serde_json::Value = serde_json::from_slice(&output).expect("stdout is json");
    assert_eq!(
        printed,
        load_json(&fixtures_dir().join("expected").join("document.json"))
    );
}

#[test]
fn eval_inline_expression() {
    let mut cmd = cargo_bin_cmd!("sheetmorph");
    cmd.arg("eval")
        .arg("-f")
        .arg(fixtures_dir().join("gamebus"))
        .arg("-s")
        .arg("unit")
        .arg("-x")
        .arg("unit[UCUM_code = 's'].unit");

    cmd.assert()
        .success()
        .stdout(predicate::str::diff("\"seconds\"\n"));
}

#[test]
fn eval_absent_result_prints_nothing() {
    let mut cmd = cargo_bin_cmd!("sheetmorph");
    cmd.arg("eval")
        .arg("-f")
        .arg(fixtures_dir().join("gamebus"))
        .arg("-s")
        .arg("unit")
        .arg("-x")
        .arg("unit.nothing");

    cmd.assert()
        .success()
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("no result"));
}

#[test]
fn eval_syntax_error_reports_position() {
    let mut cmd = cargo_bin_cmd!("sheetmorph");
    cmd.arg("eval")
        .arg("-f")
        .arg(fixtures_dir().join("gamebus"))
        .arg("-s")
        .arg("unit")
        .arg("-x")
        .arg("unit.(");

    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("line 1"));
}

#[test]
fn convert_writes_harmonization_files() {
    let temp = tempfile::tempdir().expect("tempdir");
    let out_dir = temp.path().join("out");

    let mut cmd = cargo_bin_cmd!("sheetmorph");
    cmd.arg("convert")
        .arg("-f")
        .arg(fixtures_dir().join("gamebus"))
        .arg("-s")
        .arg("property")
        .arg("unit")
        .arg("-e")
        .arg(fixtures_dir().join("jsonata").join("observation-code.jsonata"))
        .arg(fixtures_dir().join("jsonata").join("unit.jsonata"))
        .arg("-o")
        .arg(&out_dir);

    cmd.assert()
        .success()
        .stderr(predicate::str::contains("Wrote observation-code.harmonization.json"))
        .stderr(predicate::str::contains("Transformation done!"));

    assert_eq!(
        load_json(&out_dir.join("observation-code.harmonization.json")),
        load_json(&fixtures_dir().join("expected").join("observation-code.json"))
    );
    assert_eq!(
        load_json(&out_dir.join("unit.harmonization.json")),
        load_json(&fixtures_dir().join("expected").join("unit.json"))
    );
}

#[test]
fn convert_missing_sheet_fails() {
    let temp = tempfile::tempdir().expect("tempdir");

    let mut cmd = cargo_bin_cmd!("sheetmorph");
    cmd.arg("convert")
        .arg("-f")
        .arg(fixtures_dir().join("gamebus"))
        .arg("-s")
        .arg("sheet1")
        .arg("-e")
        .arg(fixtures_dir().join("jsonata").join("unit.jsonata"))
        .arg("-o")
        .arg(temp.path());

    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("Sheet sheet1 not found"));
}

#[test]
fn convert_with_manifest_and_output_override() {
    let temp = tempfile::tempdir().expect("tempdir");
    let dir = temp.path();
    let manifest = format!(
        "source: {}\nsheets: [unit]\noutput_dir: ignored\nmappings:\n  \
         - name: Units\n    expression_text: \"unit.unit\"\n",
        fixtures_dir().join("gamebus").display()
    );
    let manifest_path = write_file(dir, "mapping.yaml", &manifest);
    let out_dir = dir.join("override");

    let mut cmd = cargo_bin_cmd!("sheetmorph");
    cmd.arg("convert")
        .arg("-m")
        .arg(manifest_path)
        .arg("-o")
        .arg(&out_dir);

    cmd.assert().success();
    assert_eq!(
        load_json(&out_dir.join("Units.harmonization.json")),
        serde_json::json!(["meters", "seconds"])
    );
    assert!(!dir.join("ignored").exists());
}

#[test]
fn convert_keep_going_reports_failures() {
    let temp = tempfile::tempdir().expect("tempdir");
    let dir = temp.path();
    let broken = write_file(dir, "broken.jsonata", "$nosuch(unit)");
    let codes = write_file(dir, "codes.jsonata", "unit.UCUM_code");
    let out_dir = dir.join("out");

    let mut cmd = cargo_bin_cmd!("sheetmorph");
    cmd.arg("convert")
        .arg("-f")
        .arg(fixtures_dir().join("gamebus"))
        .arg("-s")
        .arg("unit")
        .arg("-e")
        .arg(&broken)
        .arg(&codes)
        .arg("-o")
        .arg(&out_dir)
        .arg("--keep-going");

    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("$nosuch"))
        .stderr(predicate::str::contains("1 of 2 expressions failed"));
    assert_eq!(
        load_json(&out_dir.join("codes.harmonization.json")),
        serde_json::json!(["m", "s"])
    );
}

#[test]
fn convert_requires_expressions_or_manifest() {
    let mut cmd = cargo_bin_cmd!("sheetmorph");
    cmd.arg("convert")
        .arg("-f")
        .arg(fixtures_dir().join("gamebus"))
        .arg("-s")
        .arg("unit");

    cmd.assert().code(2);
}
