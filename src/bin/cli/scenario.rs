use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use stomp_session::{
    BoxError, Client, EventLoop, MemorySink, Options, Runtime, SendOptions, SessionError, Stomp,
    SubscribeOptions,
};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::args::Cli;
use super::{describe_error, exit_codes, summary};

const DEFAULT_ADDRESS: &str = "127.0.0.1:61613";

/// Options from `--config`, with command-line values applied on top.
pub fn load_options(cli: &Cli) -> Result<Options, (String, u8)> {
    let mut opts = match &cli.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path).map_err(|e| {
                (
                    format!("Cannot read {}: {}", path.display(), e),
                    exit_codes::USAGE_ERROR,
                )
            })?;
            serde_json::from_str::<Options>(&raw).map_err(|e| {
                (
                    format!("Invalid options in {}: {}", path.display(), e),
                    exit_codes::USAGE_ERROR,
                )
            })?
        }
        None => Options::default(),
    };
    if let Some(address) = &cli.address {
        opts.address = address.clone();
    }
    if opts.address.is_empty() {
        opts.address = DEFAULT_ADDRESS.to_string();
    }
    if let Some(protocol) = &cli.protocol {
        opts.protocol = protocol.clone();
    }
    if let Some(login) = &cli.login {
        opts.user = login.clone();
    }
    if let Some(passcode) = &cli.passcode {
        opts.pass = passcode.clone();
    }
    opts.verbose |= cli.verbose;
    Ok(opts)
}

/// Per-session destination, so concurrent sessions never drain each other.
fn destination(cli: &Cli, session: usize) -> String {
    if cli.sessions > 1 {
        format!("{}.{}", cli.destination, session)
    } else {
        cli.destination.clone()
    }
}

fn body(cli: &Cli, n: usize) -> String {
    cli.body.replace("{n}", &n.to_string())
}

fn send_options(cli: &Cli) -> SendOptions {
    let opts = SendOptions::default().header("x-scenario", "stomp-session");
    if cli.receipt { opts.with_receipt() } else { opts }
}

/// Run the scenario and print the metric summary. Ctrl-C cancels the host
/// context, which stops every session.
pub async fn run(cli: Arc<Cli>) -> Result<(), (String, u8)> {
    let opts = Arc::new(load_options(&cli)?);
    let (runtime, event_loop) = Runtime::new();
    let sink = MemorySink::new();
    runtime.set_sink(sink.clone());
    let stomp = Arc::new(Stomp::new(runtime.clone()));

    let interrupted = runtime.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupted, shutting down");
            interrupted.shutdown();
        }
    });

    info!(
        address = %opts.address,
        protocol = opts.protocol(),
        sessions = cli.sessions,
        iterations = cli.iterations,
        listener = cli.listener,
        "starting scenario"
    );
    let started = Instant::now();
    let result = if cli.listener {
        run_listeners(&cli, &opts, &stomp, event_loop).await
    } else {
        run_readers(&cli, &opts, &stomp).await
    };
    println!("{}", summary::render(&sink, started.elapsed()));
    result.map_err(|e| describe_error(&e, &opts.address))
}

/// Pull mode: every session sends one message, reads it back and acks it
/// when the ack mode asks for it.
async fn run_readers(cli: &Arc<Cli>, opts: &Arc<Options>, stomp: &Arc<Stomp>) -> Result<(), SessionError> {
    let mut sessions = JoinSet::new();
    for idx in 0..cli.sessions {
        let (cli, opts, stomp) = (cli.clone(), opts.clone(), stomp.clone());
        sessions.spawn(async move {
            let client = stomp.connect(&opts).await?;
            let outcome = read_back(&cli, &client, idx).await;
            client.disconnect().await?;
            outcome
        });
    }
    join_all(sessions).await
}

async fn read_back(cli: &Cli, client: &Client, idx: usize) -> Result<(), SessionError> {
    let dest = destination(cli, idx);
    let manual_ack = cli.ack != "auto" && !cli.ack.is_empty();
    let sub = client
        .subscribe(&dest, SubscribeOptions::new().ack(&cli.ack))
        .await?;
    let send_opts = send_options(cli);
    for n in 0..cli.iterations {
        client
            .send(&dest, "text/plain", body(cli, n), Some(&send_opts))
            .await?;
        let mut msg = sub.read().await?;
        debug!(session = idx, n, body = %msg.as_string(), "read");
        if manual_ack {
            client.ack(Some(&mut msg)).await?;
        }
    }
    sub.unsubscribe().await
}

/// Push mode: listeners on the event loop count deliveries and disconnect
/// their session once every iteration has arrived.
async fn run_listeners(
    cli: &Arc<Cli>,
    opts: &Arc<Options>,
    stomp: &Arc<Stomp>,
    mut event_loop: EventLoop,
) -> Result<(), SessionError> {
    let manual_ack = cli.ack != "auto" && !cli.ack.is_empty();
    let mut clients = Vec::with_capacity(cli.sessions);
    for idx in 0..cli.sessions {
        let client = stomp.connect(opts).await?;
        let received = Arc::new(AtomicUsize::new(0));
        let expected = cli.iterations;
        let watcher = client.clone();
        let listener_opts = SubscribeOptions::new().ack(&cli.ack).listener(move |mut msg| {
            let (watcher, received) = (watcher.clone(), received.clone());
            async move {
                if manual_ack {
                    watcher.ack(Some(&mut msg)).await?;
                }
                if received.fetch_add(1, Ordering::SeqCst) + 1 >= expected {
                    watcher.disconnect().await?;
                }
                Ok::<(), BoxError>(())
            }
        });
        let error_opts = listener_opts.error_listener(move |err| async move {
            warn!(session = idx, error = %err.error, "delivery failed");
            Ok::<(), BoxError>(())
        });
        client.subscribe(&destination(cli, idx), error_opts).await?;
        clients.push(client);
    }

    // Senders run beside the event loop so a full subscription channel
    // never stalls them.
    let mut senders = JoinSet::new();
    for (idx, client) in clients.into_iter().enumerate() {
        let cli = cli.clone();
        senders.spawn(async move {
            let dest = destination(&cli, idx);
            let send_opts = send_options(&cli);
            for n in 0..cli.iterations {
                client
                    .send(&dest, "text/plain", body(&cli, n), Some(&send_opts))
                    .await?;
            }
            Ok(())
        });
    }

    event_loop.run().await?;
    join_all(senders).await
}

async fn join_all(mut tasks: JoinSet<Result<(), SessionError>>) -> Result<(), SessionError> {
    let mut first_err = None;
    while let Some(joined) = tasks.join_next().await {
        let outcome = match joined {
            Ok(outcome) => outcome,
            Err(e) => Err(SessionError::Listener(Box::new(e))),
        };
        if let Err(e) = outcome {
            warn!(error = %e, "session failed");
            first_err.get_or_insert(e);
        }
    }
    first_err.map_or(Ok(()), Err)
}
