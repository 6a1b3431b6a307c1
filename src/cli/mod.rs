pub mod artifacts;
pub mod catalog;
pub mod daemon;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Artifact Vault - durable storage for generated images
#[derive(Parser, Debug)]
#[command(
    name = "avault",
    version,
    about = "Artifact Vault - durable storage for generated images"
)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short = 'c', long = "config", global = true)]
    pub config: Option<PathBuf>,

    /// Data directory path
    #[arg(long = "data-dir", global = true)]
    pub data_dir: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the HTTP server
    Serve {
        /// Address to bind (overrides config)
        #[arg(long)]
        host: Option<String>,

        /// Port to listen on (overrides config)
        #[arg(short = 'p', long)]
        port: Option<u16>,
    },

    /// Query a running server's health endpoint
    Status {
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        #[arg(short = 'p', long, default_value_t = 8390)]
        port: u16,
    },

    /// Report whether artifact references are ephemeral
    Classify {
        /// One or more URLs or paths
        #[arg(required = true)]
        urls: Vec<String>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Copy an ephemeral artifact into durable storage
    Migrate {
        /// Artifact URL
        url: String,

        /// File name to store under (extension is kept or inferred)
        #[arg(short = 'n', long)]
        name: Option<String>,
    },

    /// Submit a generation request and wait for the durable result
    Generate {
        /// Text prompt
        #[arg(long, conflicts_with = "request")]
        prompt: Option<String>,

        /// Input image (URL or base64) to edit
        #[arg(long = "input-image", conflicts_with = "request")]
        input_image: Option<String>,

        /// Full provider request body as a JSON file
        #[arg(long, value_name = "FILE")]
        request: Option<PathBuf>,

        /// Print each status check
        #[arg(long)]
        progress: bool,
    },

    /// Inspect and maintain the project catalog
    Catalog {
        #[command(subcommand)]
        action: CatalogAction,
    },
}

#[derive(Subcommand, Debug)]
pub enum CatalogAction {
    /// List catalog entries
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show entries that still reference ephemeral images
    Analyze,

    /// Migrate every ephemeral image in the catalog
    MigrateAll,

    /// Write the catalog as JSON to stdout or a file
    Export {
        #[arg(short = 'o', long, value_name = "FILE")]
        output: Option<PathBuf>,
    },

    /// Merge entries from a previous export
    Import {
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },

    /// Restore the catalog from its most recent backup
    Restore,
}

/// Build the base URL for the server HTTP API.
pub fn base_url(host: &str, port: u16) -> String {
    format!("http://{}:{}", host, port)
}

/// Format a connection error message for when the server is not reachable.
pub fn connection_error_message(host: &str, port: u16) -> String {
    format!(
        "Could not connect to artifact-vault at {}:{}. Is it running? (try: avault serve)",
        host, port
    )
}

/// Dispatch the CLI command to the appropriate handler.
pub async fn dispatch(cli: &Cli) -> anyhow::Result<()> {
    let config = cli.config.as_deref();
    let data_dir = cli.data_dir.as_deref();

    match &cli.command {
        Some(Commands::Serve { host, port }) => {
            crate::daemon::serve(config, data_dir, host.as_deref(), *port, cli.verbose).await
        }
        Some(Commands::Status { host, port }) => {
            daemon::cmd_status(host, *port, cli.verbose).await
        }
        Some(Commands::Classify { urls, json }) => artifacts::cmd_classify(config, urls, *json),
        Some(Commands::Migrate { url, name }) => {
            artifacts::cmd_migrate(config, data_dir, url, name.as_deref()).await
        }
        Some(Commands::Generate {
            prompt,
            input_image,
            request,
            progress,
        }) => {
            let body = artifacts::build_request(
                prompt.as_deref(),
                input_image.as_deref(),
                request.as_deref(),
            )?;
            artifacts::cmd_generate(config, data_dir, body, *progress).await
        }
        Some(Commands::Catalog { action }) => catalog::cmd_catalog(config, data_dir, action).await,
        None => {
            // No subcommand provided -- print help
            use clap::CommandFactory;
            Cli::command().print_help()?;
            println!();
            Ok(())
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_cli_version_flag() {
        let result = Cli::try_parse_from(["avault", "--version"]);
        assert!(result.is_err());
        let err = result.unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayVersion);
        assert!(err.to_string().contains(env!("CARGO_PKG_VERSION")));
    }

    #[test]
    fn test_cli_serve_overrides() {
        let cli = Cli::try_parse_from(["avault", "serve", "--host", "0.0.0.0", "-p", "9000"])
            .expect("Should parse serve");
        match &cli.command {
            Some(Commands::Serve { host, port }) => {
                assert_eq!(host.as_deref(), Some("0.0.0.0"));
                assert_eq!(*port, Some(9000));
            }
            other => panic!("Expected Serve command, got: {:?}", other),
        }
    }

    #[test]
    fn test_cli_global_config_and_data_dir() {
        let cli = Cli::try_parse_from([
            "avault",
            "catalog",
            "list",
            "--config",
            "/etc/vault.json",
            "--data-dir",
            "/var/lib/vault",
        ])
        .expect("Should parse globals after subcommand");
        assert_eq!(cli.config, Some(PathBuf::from("/etc/vault.json")));
        assert_eq!(cli.data_dir, Some(PathBuf::from("/var/lib/vault")));
        assert!(matches!(
            cli.command,
            Some(Commands::Catalog {
                action: CatalogAction::List { json: false }
            })
        ));
    }

    #[test]
    fn test_cli_classify_requires_url() {
        assert!(Cli::try_parse_from(["avault", "classify"]).is_err());
        let cli = Cli::try_parse_from(["avault", "classify", "a", "b", "--json"]).unwrap();
        match cli.command {
            Some(Commands::Classify { urls, json }) => {
                assert_eq!(urls, vec!["a".to_string(), "b".to_string()]);
                assert!(json);
            }
            other => panic!("Expected Classify command, got: {:?}", other),
        }
    }

    #[test]
    fn test_cli_generate_prompt_conflicts_with_request_file() {
        let result = Cli::try_parse_from([
            "avault",
            "generate",
            "--prompt",
            "loft",
            "--request",
            "req.json",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_cli_catalog_import_takes_file() {
        let cli = Cli::try_parse_from(["avault", "catalog", "import", "backup.json"]).unwrap();
        match cli.command {
            Some(Commands::Catalog {
                action: CatalogAction::Import { file },
            }) => assert_eq!(file, PathBuf::from("backup.json")),
            other => panic!("Expected Catalog Import, got: {:?}", other),
        }
    }

    #[test]
    fn test_cli_status_defaults() {
        let cli = Cli::try_parse_from(["avault", "status"]).unwrap();
        match cli.command {
            Some(Commands::Status { host, port }) => {
                assert_eq!(host, "127.0.0.1");
                assert_eq!(port, 8390);
            }
            other => panic!("Expected Status, got: {:?}", other),
        }
    }

    #[test]
    fn test_no_subcommand_parses() {
        let cli = Cli::try_parse_from(["avault"]).unwrap();
        assert!(cli.command.is_none());
    }

    #[test]
    fn test_base_url() {
        assert_eq!(base_url("127.0.0.1", 8390), "http://127.0.0.1:8390");
    }

    #[test]
    fn test_connection_error_message() {
        let msg = connection_error_message("localhost", 8390);
        assert!(msg.contains("localhost:8390"));
        assert!(msg.contains("avault serve"));
    }
}
