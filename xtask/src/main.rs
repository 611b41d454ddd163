//! Build automation tasks for DAP
//!
//! Currently generates the `dap-ingest` command reference from its clap
//! definitions.

use clap::Parser;
use std::fs;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "Build automation tasks for DAP", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Parser)]
enum Command {
    /// Generate the dap-ingest command reference in Markdown
    GenerateCliDocs {
        /// Output directory for generated documentation
        #[arg(short, long, default_value = "docs")]
        output_dir: String,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::GenerateCliDocs { output_dir } => generate_cli_docs(&output_dir)?,
    }

    Ok(())
}

fn generate_cli_docs(output_dir: &str) -> anyhow::Result<()> {
    println!("Generating CLI documentation...");

    let markdown = clap_markdown::help_markdown::<dap_ingest::Cli>();

    let content = format!(
        r#"# dap-ingest Reference

Generated from the CLI source code on {}.

## Quick Start

```bash
# Create descriptors for every source in config/default.toml
dap-ingest seed

# Visit, fetch and stage whatever is due
dap-ingest run

# Only one source
dap-ingest run --source labels

# Provenance log of a source
dap-ingest events labels --since 2024-01-01T00:00:00Z
```

## Exit Codes

| code | meaning |
|------|---------|
| 0  | every source done or skipped |
| 10 | profile, section or option missing |
| 11 | profile malformed |
| 20 | transient network failure after retries |
| 21 | permanent failure |
| 30 | upstream page or index layout changed |
| 31 | unsafe archive member |
| 32 | integrity mismatch |
| 40 | staged input could not be parsed |
| 50 | cancelled |
| 60 | metadata repository unavailable |

## Commands

{}

## Environment Variables

- `DAP_CONFIG_DIR` - Directory holding `<profile>.toml` (default: `./config`)
- `DAP_PROFILE` - Profile name (default: `default`)
- `DAP__<SECTION>__<KEY>` - Override any profile key, e.g. `DAP__SOURCE__LABELS__LIFECYCLE_DAYS=14`
- `LOG_LEVEL`, `LOG_OUTPUT`, `LOG_FORMAT`, `LOG_DIR` - Logging

---

*To update, run `cargo xtask generate-cli-docs`.*
"#,
        chrono::Utc::now().format("%Y-%m-%d"),
        markdown
    );

    let output_path = PathBuf::from(output_dir);
    fs::create_dir_all(&output_path)?;

    let file_path = output_path.join("cli-reference.md");
    fs::write(&file_path, content)?;

    println!("Generated CLI documentation at: {}", file_path.display());

    Ok(())
}
