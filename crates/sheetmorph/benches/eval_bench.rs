use std::path::{Path, PathBuf};

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use serde_json::{Value as JsonValue, json};
use sheetmorph::{Evaluator, load_document, parse_expression};

fn fixtures_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
}

fn wide_document(rows: usize) -> JsonValue {
    let property: Vec<JsonValue> = (0..rows)
        .map(|i| {
            json!({
                "game_property": format!("PROP_{}", i),
                "LOINC_code": format!("L{:04}", i),
                "LOINC_display": format!("Property {}", i),
                "LOINC_equivalence": if i % 2 == 0 { "equivalent" } else { "wider" },
            })
        })
        .collect();
    json!({ "property": property })
}

fn bench_gamebus(c: &mut Criterion) {
    let document = load_document(&fixtures_dir().join("gamebus"), &["property", "unit"])
        .expect("load gamebus sheets");
    let path = fixtures_dir().join("jsonata").join("observation-code.jsonata");
    let text = std::fs::read_to_string(path).expect("read expression");

    c.bench_function("parse_observation_code", |b| {
        b.iter(|| parse_expression(black_box(&text)).expect("parse"))
    });

    let expr = parse_expression(&text).expect("parse");
    c.bench_function("eval_observation_code", |b| {
        b.iter(|| {
            Evaluator::new(black_box(document.as_value()))
                .evaluate(&expr)
                .expect("evaluate")
        })
    });
}

fn bench_wide_sheet(c: &mut Criterion) {
    let document = wide_document(5_000);
    let expr = parse_expression(
        "property[LOINC_equivalence = 'equivalent']\
         .{ 'code': game_property, 'target': $uppercase(LOINC_display) }",
    )
    .expect("parse");
    c.bench_function("eval_filter_project_5000", |b| {
        b.iter(|| Evaluator::new(black_box(&document)).evaluate(&expr).expect("evaluate"))
    });
}

criterion_group!(benches, bench_gamebus, bench_wide_sheet);
criterion_main!(benches);
