use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;
use vanity_commit::{
    git::{amend_with_prefix, GitCommandRepository},
    HashPrefix, InvalidInputError,
};

#[derive(Parser)]
#[command(
    name = "vanity_commit",
    version,
    about = "Amends the latest git commit so that its hash starts with the given prefix",
    long_about = "Amends the latest git commit so that its hash starts with the given prefix. \
    Only invisible whitespace is added to the end of the commit message; the author, the \
    committer, the dates, and the diff are kept as they are."
)]
struct Cli {
    #[arg(
        index = 1,
        value_name = "commit-hash-prefix",
        help = "A lowercase hex string of 1 to 40 characters [default: 0000000]"
    )]
    prefix: Option<String>,
}

impl Cli {
    fn desired_prefix(&self) -> Result<HashPrefix, InvalidInputError> {
        match &self.prefix {
            Some(prefix) => HashPrefix::new(prefix),
            None => Ok(HashPrefix::default()),
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let desired_prefix = cli.desired_prefix()?;

    amend_with_prefix(&mut GitCommandRepository::new(), &desired_prefix)
        .with_context(|| format!("failed to give the current commit the prefix {}", desired_prefix))?;

    Ok(())
}
