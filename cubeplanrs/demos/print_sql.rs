use std::{env, fs, path::PathBuf};

use cubeplan::{dialect_for, logging::init_tracing, CompilerConfig, CubeRegistry, QueryCompiler, QuerySpec};

fn usage() {
    eprintln!("Usage: print_sql <models_dir> <query_json> [dialect]");
    eprintln!("Example: cargo run --example print_sql -- demos/models demos/requests/revenue_by_status.json postgres");
}

fn main() -> anyhow::Result<()> {
    init_tracing("cubeplan=info");

    let mut args = env::args().skip(1).collect::<Vec<_>>();
    if args.len() < 2 {
        usage();
        std::process::exit(1);
    }

    let models_dir = PathBuf::from(args.remove(0));
    let query_path = PathBuf::from(args.remove(0));
    let dialect_name = args.pop().unwrap_or_else(|| "postgres".to_string());

    let registry = CubeRegistry::load_from_dir(models_dir)?;
    let dialect = dialect_for(&dialect_name)?;
    let spec: QuerySpec = serde_json::from_str(&fs::read_to_string(query_path)?)?;

    let compiler = QueryCompiler::new(&registry, dialect.as_ref())?.with_config(CompilerConfig::load_default());
    let compiled = compiler.compile(&spec)?;

    println!("{}", compiled.sql.0);
    println!("-- params: {}", serde_json::to_string(&compiled.sql.1)?);
    if let Some(name) = &compiled.used_pre_aggregation {
        println!("-- pre-aggregation: {name}");
    }
    for description in &compiled.pre_aggregations {
        println!("-- load {}: {}", description.table_name, description.load_sql.0);
    }
    Ok(())
}
