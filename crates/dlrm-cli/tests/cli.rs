use clap::Parser;
use dlrm_cli::{Cli, Commands};
use dlrm_engine::ShapeContract;

fn write_config(dir: &tempfile::TempDir) -> std::path::PathBuf {
    let path = dir.path().join("model.json");
    let json = serde_json::json!({
        "sparse_feature_size": 4,
        "embedding_rows": [50, 60, 70],
        "bottom_mlp": [3, 8, 4],
        "top_mlp": [10, 4, 1],
        "embedding_bits": 8,
        "mlp_bits": 16
    });
    std::fs::write(&path, serde_json::to_string_pretty(&json).unwrap()).unwrap();
    path
}

#[test]
fn cli_parses_bench_flags() {
    let cli = Cli::parse_from([
        "dlrm",
        "bench",
        "--arch-sparse-feature-size",
        "16",
        "--arch-embedding-size",
        "1000-500-200",
        "--arch-mlp-bot",
        "13-64-16",
        "--arch-mlp-top",
        "32-1",
        "--arch-interaction-itself",
        "--quantize-emb-bit-width",
        "4",
        "--num-indices-per-lookup",
        "5",
        "--num-indices-per-lookup-fixed",
        "--mini-batch-size",
        "64",
        "--ranks",
        "4",
    ]);
    let Commands::Bench(cmd) = cli.command else {
        panic!("expected bench");
    };
    assert_eq!(cmd.ranks, 4);
    assert_eq!(cmd.mini_batch_size, 64);
    assert!(cmd.num_indices_per_lookup_fixed);

    let config = cmd.model.to_config().unwrap();
    // Four features with self pairs: 16 + 10.
    assert_eq!(config.top_mlp, vec![26, 32, 1]);
    assert_eq!(config.embedding_bits, 4);
}

#[tokio::test]
async fn describe_writes_contract_from_json_config() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(&dir);
    let output = dir.path().join("contract.json");
    let cli = Cli::parse_from([
        "dlrm",
        "describe",
        "--config",
        config.to_str().unwrap(),
        "--output",
        output.to_str().unwrap(),
    ]);
    let Commands::Describe(cmd) = cli.command else {
        panic!("expected describe");
    };
    cmd.run().await.unwrap();

    let contract: ShapeContract =
        serde_json::from_str(&std::fs::read_to_string(&output).unwrap()).unwrap();
    assert_eq!(contract.num_tables, 3);
    assert_eq!(contract.tables.len(), 3);
    assert_eq!(contract.interaction.output_width, 10);
    assert_eq!(contract.bottom.widths, vec![3, 8, 4]);
    assert!(contract.bottom.bits.iter().all(|&b| b == 16));
    assert!(contract.tables.iter().all(|t| t.output_width == 4));
    assert!(contract.rank.is_none());
}

#[test]
fn describe_shard_holds_its_tables() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(&dir);
    let cli = Cli::parse_from([
        "dlrm",
        "describe",
        "--config",
        config.to_str().unwrap(),
        "--rank",
        "1",
        "--ranks",
        "2",
    ]);
    let Commands::Describe(cmd) = cli.command else {
        panic!("expected describe");
    };
    let contract = cmd.contract().unwrap();
    assert_eq!(contract.num_tables, 3);
    assert_eq!(contract.rank, Some(1));
    let held: Vec<usize> = contract.tables.iter().map(|t| t.global_index).collect();
    assert_eq!(held, vec![2]);
    assert_eq!(contract.tables[0].owner, Some(1));
}

#[test]
fn rank_requires_ranks() {
    let err = Cli::try_parse_from(["dlrm", "describe", "--rank", "1"]).unwrap_err();
    assert_eq!(err.kind(), clap::error::ErrorKind::MissingRequiredArgument);
}

#[test]
fn missing_config_file_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let cli = Cli::parse_from([
        "dlrm",
        "describe",
        "--config",
        dir.path().join("absent.json").to_str().unwrap(),
    ]);
    let Commands::Describe(cmd) = cli.command else {
        panic!("expected describe");
    };
    let err = cmd.contract().unwrap_err();
    assert!(format!("{err:#}").contains("Failed to load model config"));
}
