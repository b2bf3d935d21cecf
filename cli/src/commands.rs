use gridlib::config::GridConfig;
use gridlib::ipc::Channel;
use gridlib::types::BoxError;
use gridlib::{
    submit, Consumer, Dispatcher, JobResult, MemoryStore, OutputLine, ResultHandler, Runner,
    Streamer, Submission,
};

use futures::StreamExt;
use std::error;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

type CliResult = Result<(), Box<dyn error::Error>>;

/// Split a command line into a submission.
fn submission(line: &str) -> Result<Option<Submission>, shell_words::ParseError> {
    let argv = shell_words::split(line)?;
    Ok(argv
        .split_first()
        .map(|(command, args)| Submission::new(command.as_str(), args.to_vec())))
}

fn print_line(line: &OutputLine) {
    match &line.data {
        Some(data) => println!("{} {}: {}", line.job_id, data.line_no, data.text),
        None => println!("{} exited with {:?}", line.job_id, line.exit_code),
    }
}

pub async fn run(
    config: &GridConfig,
    argv: Vec<String>,
    timeout: Option<Duration>,
    tag: Option<String>,
    publish: Option<PathBuf>,
) -> CliResult {
    let (command, args) = argv.split_first().ok_or("missing command")?;
    let mut request = Submission::new(command.as_str(), args.to_vec());
    if let Some(timeout) = timeout {
        request = request.timeout(timeout);
    }
    if let Some(tag) = tag {
        request = request.tag(tag);
    }

    let channel = match publish {
        Some(endpoint) => {
            let channel = Channel::<JobResult>::with_config(endpoint, config.ipc.clone());
            channel.bind().await?;
            // let watchers that were waiting for the socket attach
            tokio::time::sleep(config.ipc.reconnect_interval * 2).await;
            Some(channel)
        }
        None => None,
    };

    let store = Arc::new(MemoryStore::new());
    let job = submit(store.as_ref(), request).await?;
    let result = Runner::new(config.runner.clone(), store).run(job).await;

    if let Some(channel) = &channel {
        let delivered = channel.publish(&result).await?;
        tracing::info!(job_id = %result.job_id(), delivered, "published job result");
    }
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

pub async fn dispatch(
    config: &GridConfig,
    publish: Option<PathBuf>,
    workers: Option<usize>,
) -> CliResult {
    let mut dispatcher_config = config.dispatcher.clone();
    if workers.is_some() {
        dispatcher_config.max_workers = workers;
    }
    let store = Arc::new(MemoryStore::new());
    let dispatcher = Dispatcher::new(dispatcher_config, store.clone());
    tracing::info!(workers = dispatcher.pool_size(), "dispatcher ready");

    let channel = match publish {
        Some(endpoint) => {
            let channel = Channel::<OutputLine>::with_config(endpoint, config.ipc.clone());
            channel.bind().await?;
            Some(channel)
        }
        None => None,
    };

    let mut handles = vec![];
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = stdin.next_line().await? {
        let request = match submission(&line) {
            Ok(Some(request)) => request,
            Ok(None) => continue,
            Err(err) => {
                tracing::warn!(line = %line, error = %err, "skipping unparsable command line");
                continue;
            }
        };
        let job = submit(store.as_ref(), request).await?;
        handles.push(dispatcher.dispatch(job));
    }

    loop {
        let finished = handles.iter().all(|handle| handle.is_finished());
        let channel = channel.as_ref();
        dispatcher
            .consume_async(|line| async move {
                print_line(&line);
                if let Some(channel) = channel {
                    if let Err(err) = channel.publish(&line).await {
                        tracing::warn!(error = %err, "failed to publish output line");
                    }
                }
            })
            .await;
        if finished && !dispatcher.has_output() {
            break;
        }
        tokio::time::sleep(config.streamer.poll_interval).await;
    }
    Ok(())
}

pub async fn stream(config: &GridConfig, name: String, jobs: Vec<String>, follow: bool) -> CliResult {
    let store = Arc::new(MemoryStore::new());
    for line in &jobs {
        if let Some(request) = submission(line)? {
            submit(store.as_ref(), request.stream(name.as_str())).await?;
        }
    }

    let streamer = Streamer::new(store, name, config.streamer.clone());
    let mut frames = if follow {
        let shutdown = CancellationToken::new();
        let on_interrupt = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                on_interrupt.cancel();
            }
        });
        streamer.follow(shutdown)
    } else {
        streamer.generate()
    };

    let stdout = std::io::stdout();
    while let Some(frame) = frames.next().await {
        let mut out = stdout.lock();
        out.write_all(&frame)?;
        out.write_all(b"\n")?;
        out.flush()?;
    }
    Ok(())
}

pub async fn tail(config: &GridConfig, endpoint: PathBuf) -> CliResult {
    let channel = Channel::<OutputLine>::with_config(endpoint, config.ipc.clone());
    let mut subscription = channel.subscribe();
    loop {
        tokio::select! {
            line = subscription.recv() => match line {
                Some(line) => print_line(&line),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    subscription.close().await;
    Ok(())
}

struct PrintResults;

impl ResultHandler for PrintResults {
    fn on_result(&self, result: &JobResult) -> Result<(), BoxError> {
        println!("{}", serde_json::to_string(result)?);
        Ok(())
    }
}

pub async fn watch(config: &GridConfig, endpoint: PathBuf) -> CliResult {
    let channel = Channel::<JobResult>::with_config(endpoint, config.ipc.clone());
    let consumer = Consumer::spawn(channel.subscribe(), PrintResults, false);
    tokio::signal::ctrl_c().await?;
    consumer.shutdown().await;
    Ok(())
}
