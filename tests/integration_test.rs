use assert_cmd::Command;
use predicates::prelude::*;
use std::io::Write;
use std::path::{Path, PathBuf};

use psmatch::mass::{residue_mass, H2O, PROTON};

fn neutral_mass(seq: &str) -> f64 {
    seq.chars().map(|c| residue_mass(c).unwrap()).sum::<f64>() + H2O
}

/// Write a peptide list and a one-spectrum MS2 file whose peaks are the
/// b2-b4 / y2-y4 ions of the first peptide.
fn write_inputs(dir: &Path, sequences: &[&str]) -> (PathBuf, PathBuf, PathBuf) {
    let peptides = dir.join("peptides.txt");
    let mut f = std::fs::File::create(&peptides).unwrap();
    for seq in sequences {
        writeln!(f, "{}", seq).unwrap();
    }

    let target = sequences[0];
    let res: Vec<f64> = target.chars().map(|c| residue_mass(c).unwrap()).collect();
    let n = res.len();
    let queries = dir.join("queries.ms2");
    let mut f = std::fs::File::create(&queries).unwrap();
    writeln!(f, "H\tCreationDate\ttest").unwrap();
    writeln!(f, "S\t1\t1\t{:.4}", neutral_mass(target) + PROTON).unwrap();
    writeln!(f, "Z\t1\t{:.4}", neutral_mass(target) + PROTON).unwrap();
    for k in 2..=4 {
        writeln!(f, "{:.4} 2000.0", res[..k].iter().sum::<f64>() + PROTON).unwrap();
        writeln!(
            f,
            "{:.4} 2000.0",
            res[n - k..].iter().sum::<f64>() + H2O + PROTON
        )
        .unwrap();
    }

    let workspace = dir.join("out");
    (peptides, queries, workspace)
}

#[test]
fn test_search_reports_true_peptide() {
    let dir = tempfile::tempdir().unwrap();
    let (peptides, queries, workspace) = write_inputs(dir.path(), &["ACDEFK", "GHIKLM"]);

    let mut cmd = Command::new(env!("CARGO_BIN_EXE_psmatch"));
    cmd.arg("-d")
        .arg(&peptides)
        .arg("-i")
        .arg(&queries)
        .arg("-w")
        .arg(&workspace)
        .arg("--threads")
        .arg("2")
        .arg("--min_cpsm")
        .arg("1")
        .arg("--noprogress")
        .assert()
        .success();

    let report = workspace.join("psms_r0.tsv");
    assert!(report.exists(), "missing {:?}", report);

    let content = std::fs::read_to_string(&report).unwrap();
    let lines: Vec<&str> = content.lines().collect();
    assert!(lines[0].starts_with("QueryId\tPrecursorMass\tPeptide"));
    assert_eq!(lines.len(), 2);
    assert!(lines[1].contains("ACDEFK"));
    assert!(!content.contains("GHIKLM"));
}

#[test]
fn test_index_cache_reused_across_runs() {
    let dir = tempfile::tempdir().unwrap();
    let (peptides, queries, workspace) = write_inputs(dir.path(), &["ACDEFK"]);

    let run = |extra: &[&str]| {
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_psmatch"));
        cmd.arg("-d")
            .arg(&peptides)
            .arg("-i")
            .arg(&queries)
            .arg("-w")
            .arg(&workspace)
            .arg("--min_cpsm")
            .arg("1")
            .arg("--noprogress");
        for arg in extra {
            cmd.arg(arg);
        }
        cmd.assert().success();
    };

    run(&[]);
    let cache = workspace.join("index_r0.pidx");
    assert!(cache.exists(), "missing {:?}", cache);

    // Second run loads the cache; a third forces a rebuild.
    run(&[]);
    run(&["--reindex"]);

    let report = workspace.join("psms_r0.tsv");
    let content = std::fs::read_to_string(report).unwrap();
    assert!(content.contains("ACDEFK"));
}

#[test]
fn test_invalid_policy_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let (peptides, queries, workspace) = write_inputs(dir.path(), &["ACDEFK"]);

    let mut cmd = Command::new(env!("CARGO_BIN_EXE_psmatch"));
    cmd.arg("-d")
        .arg(&peptides)
        .arg("-i")
        .arg(&queries)
        .arg("-w")
        .arg(&workspace)
        .arg("--policy")
        .arg("roundrobin")
        .assert()
        .failure()
        .stderr(predicate::str::contains("cyclic"));
}

#[test]
fn test_missing_database_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let (_, queries, workspace) = write_inputs(dir.path(), &["ACDEFK"]);

    let mut cmd = Command::new(env!("CARGO_BIN_EXE_psmatch"));
    cmd.arg("-d")
        .arg(dir.path().join("nope.txt"))
        .arg("-i")
        .arg(&queries)
        .arg("-w")
        .arg(&workspace)
        .assert()
        .failure()
        .stderr(predicate::str::contains("not found"));
}
