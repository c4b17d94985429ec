use std::{
    io::Write,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::{anyhow, Context};
use chainfix::{
    config::{load, Config, LogFormat},
    parse_certificates, Certificate, FixError, FixErrorType, Fixer, FixerOptions, HttpFetcher,
    RootPool,
};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing_subscriber::EnvFilter;

/// Capacity of the chain and error sinks
const SINK_CAPACITY: usize = 64;

fn main() -> Result<(), anyhow::Error> {
    // Loads configuration from command-line, YAML, HCL or environment sources
    let config = load("/etc/chainfix")?;

    setup_logging(&config);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    let all_fixed = runtime.block_on(run(config))?;
    if !all_fixed {
        std::process::exit(1);
    }

    Ok(())
}

fn setup_logging(config: &Config) {
    if !config.logging.enabled {
        return;
    }

    // stdout carries the fixed chains when no output directory is configured
    match config.logging.format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(EnvFilter::from_default_env())
            .with_max_level(&config.logging.level)
            .with_writer(std::io::stderr)
            .init(),
        LogFormat::Pretty => tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_max_level(&config.logging.level)
            .with_writer(std::io::stderr)
            .init(),
    }
}

/// Submit every input file to the fixer and wait for all of them to be
/// published. Returns `false` if any input could not be read or fixed.
async fn run(config: Config) -> Result<bool, anyhow::Error> {
    let roots_path = config
        .roots
        .as_ref()
        .ok_or_else(|| anyhow!("a roots PEM bundle is required (--roots)"))?;
    let roots = tokio::fs::read(roots_path)
        .await
        .with_context(|| format!("reading roots from {}", roots_path.display()))?;
    let roots = Arc::new(
        RootPool::from_pem(&roots)
            .with_context(|| format!("parsing roots from {}", roots_path.display()))?,
    );

    tracing::info!(
        service = %config.service_name,
        roots = roots.len(),
        inputs = config.inputs.len(),
        "loaded root pool"
    );

    let (chain_sender, chain_receiver) = mpsc::channel(SINK_CAPACITY);
    let (error_sender, error_receiver) = mpsc::channel(SINK_CAPACITY);

    let fixer = Fixer::new(
        FixerOptions {
            worker_count: config.worker_count(),
            log_stats: config.stats.enabled,
            stats_interval: Duration::from_secs(config.stats.interval_secs),
        },
        chain_sender,
        error_sender,
        Arc::new(HttpFetcher::new(&config.fetch)?),
    )?;

    let writer = write_chains(chain_receiver, config.output.clone());
    let reporter = report_errors(error_receiver);

    let mut unreadable = 0usize;
    for input in &config.inputs {
        let Some((cert, chain)) = read_input(input).await else {
            unreadable += 1;
            continue;
        };

        fixer.submit(cert, chain, roots.clone()).await?;
    }

    fixer.drain().await;
    let stats = fixer.stats();
    // Workers own the only sink senders; dropping the fixer ends both consumers
    drop(fixer);

    let written = writer.await??;
    let fix_failures = reporter.await?;

    tracing::info!(
        written,
        fix_failures,
        unreadable,
        reconstructed = stats.reconstructed,
        fixed = stats.fixed,
        not_fixed = stats.not_fixed,
        "done"
    );

    Ok(unreadable == 0 && stats.not_fixed == 0)
}

/// Read a PEM/DER/PKCS7 file holding a leaf followed by its chain
async fn read_input(path: &Path) -> Option<(Certificate, Vec<Certificate>)> {
    let data = match tokio::fs::read(path).await {
        Ok(data) => data,
        Err(err) => {
            tracing::warn!(path = %path.display(), "cannot read input: {err}");
            return None;
        }
    };

    let mut certs = match parse_certificates(&data) {
        Ok(certs) if !certs.is_empty() => certs,
        Ok(_) => {
            tracing::warn!(path = %path.display(), "input holds no certificates");
            return None;
        }
        Err(err) => {
            tracing::warn!(path = %path.display(), "cannot parse input: {err}");
            return None;
        }
    };

    let chain = certs.split_off(1);
    let leaf = certs.remove(0);
    Some((leaf, chain))
}

/// Write each published chain as PEM, either to stdout or to `<output>/<n>.pem`
fn write_chains(
    mut chains: mpsc::Receiver<Vec<Certificate>>,
    output: Option<PathBuf>,
) -> JoinHandle<Result<usize, anyhow::Error>> {
    tokio::spawn(async move {
        if let Some(dir) = &output {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("creating {}", dir.display()))?;
        }

        let mut written = 0usize;
        while let Some(chain) = chains.recv().await {
            let mut pem = Vec::new();
            for cert in &chain {
                pem.extend_from_slice(&cert.x509().to_pem()?);
            }

            match &output {
                Some(dir) => {
                    let path = dir.join(format!("{written}.pem"));
                    tokio::fs::write(&path, &pem)
                        .await
                        .with_context(|| format!("writing {}", path.display()))?;
                }
                None => std::io::stdout().lock().write_all(&pem)?,
            }

            written += 1;
        }

        Ok(written)
    })
}

/// Log every error the fixer publishes; returns how many were `FixFailed`
fn report_errors(mut errors: mpsc::Receiver<FixError>) -> JoinHandle<usize> {
    tokio::spawn(async move {
        let mut fix_failures = 0usize;
        while let Some(err) = errors.recv().await {
            if err.kind == FixErrorType::FixFailed {
                fix_failures += 1;
            }

            tracing::warn!(
                kind = %err.kind,
                url = err.url.as_deref(),
                chain_len = err.chain.len(),
                bad_len = err.bad.as_ref().map(|bad| bad.len()),
                "{err}"
            );
        }

        fix_failures
    })
}
