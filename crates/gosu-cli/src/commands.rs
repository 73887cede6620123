//! Client verb dispatch.

use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context};
use gosu_client::{Client, ClientError};
use gosu_core::job::Manifest;
use gosu_types::{JobInfo, JobList, WhiteboardEntry, WhiteboardKey};
use serde_json::Value;

use crate::args;
use crate::table;

pub async fn run(verb: &str, rest: &[String]) -> anyhow::Result<()> {
    let parsed = args::parse(rest)?;
    let client = Client::local();

    match verb {
        "list" | "ls" => {
            client.ensure_daemon().await?;
            let list: JobList = client.call("job.List", &parsed.body).await?;
            print!("{}", table::render(&list));
            Ok(())
        }
        "view" | "v" => {
            client.ensure_daemon().await?;
            view(&client, &parsed.body).await
        }
        "launch" | "a" => launch(&client, "job.Launch", parsed).await,
        "update" | "u" => launch(&client, "job.Update", parsed).await,
        "start" | "s" => control(&client, "job.Start", &parsed.body, "Started").await,
        "stop" | "x" => control(&client, "job.Stop", &parsed.body, "Stopped").await,
        "restart" | "r" => control(&client, "job.Restart", &parsed.body, "Restarted").await,
        "kill" | "k" => control(&client, "job.Kill", &parsed.body, "Killed").await,
        "delete" | "d" => control(&client, "job.Delete", &parsed.body, "Deleted").await,
        "signal" => {
            client.ensure_daemon().await?;
            let _: Value = client.call("event.Signal", &parsed.body).await?;
            Ok(())
        }
        "get" => {
            client.ensure_daemon().await?;
            let key = whiteboard_key(&parsed.body)?;
            let entries: Vec<WhiteboardEntry> = client.call("whiteboard.Get", &key).await?;
            for entry in entries {
                println!("{}:{}: {}", entry.key.job, entry.key.key, entry.value);
            }
            Ok(())
        }
        "put" => {
            client.ensure_daemon().await?;
            let key = whiteboard_key(&parsed.body)?;
            let raw = rest
                .iter()
                .filter(|a| !a.starts_with('-'))
                .nth(1)
                .context("put requires a value")?;
            let value: Value =
                serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.clone()));
            let count: usize = client
                .call("whiteboard.Put", &WhiteboardEntry { key, value })
                .await?;
            println!("Put {count} values");
            Ok(())
        }
        "shutdown" => {
            // The daemon tears the connection down while answering; that
            // counts as success.
            match client.call::<Value>("daemon.Shutdown", Value::Null).await {
                Ok(_) | Err(ClientError::Connection(_)) => Ok(()),
                Err(err) => Err(err.into()),
            }
        }
        "" => bail!("missing command; try list, launch, start, stop, or shutdown"),
        other => bail!("unknown command: {other}"),
    }
}

/// Build a manifest from the body task plus option flags, then submit it.
async fn launch(client: &Client, method: &str, parsed: args::Parsed) -> anyhow::Result<()> {
    if parsed.body.is_empty() {
        bail!("a task is required, e.g. gosu launch 'run node app.js' --id=web");
    }
    let mut fields = parsed.flags;
    fields.insert("main".into(), Value::String(parsed.body));
    let manifest: Manifest = serde_json::from_value(Value::Object(fields))
        .map_err(|err| anyhow!("invalid job options: {err}"))?;

    client.ensure_daemon().await?;
    println!(
        "Submitting job:\n{}",
        serde_json::to_string_pretty(&manifest)?
    );
    let info: JobInfo = client.call(method, &manifest).await?;
    print!(
        "{}",
        table::render(&JobList {
            jobs: vec![info]
        })
    );
    Ok(())
}

async fn control(client: &Client, method: &str, pattern: &str, human: &str) -> anyhow::Result<()> {
    client.ensure_daemon().await?;
    let ids: Vec<String> = client.call(method, pattern).await?;
    println!("{human} job(s): {}", ids.join(","));
    Ok(())
}

fn whiteboard_key(body: &str) -> anyhow::Result<WhiteboardKey> {
    let (job, key) = body
        .split_once(':')
        .with_context(|| format!("invalid key: '{body}', expected job:key"))?;
    Ok(WhiteboardKey {
        job: job.to_string(),
        key: key.to_string(),
    })
}

/// Re-render the job table on a 500 ms tick, fetching at most once a
/// second, until interrupted.
async fn view(client: &Client, pattern: &str) -> anyhow::Result<()> {
    let mut last_fetch: Option<Instant> = None;
    let mut list = JobList::default();
    loop {
        let due = last_fetch
            .map(|t| t.elapsed() >= Duration::from_secs(1))
            .unwrap_or(true);
        if due {
            match client.call::<JobList>("job.List", pattern).await {
                Ok(fresh) => list = fresh,
                Err(err) => {
                    println!("fetch error: {err}");
                }
            }
            last_fetch = Some(Instant::now());
        }
        // Clear screen and redraw.
        print!("\x1b[2J\x1b[H{}", table::render(&list));
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(()),
            _ = tokio::time::sleep(Duration::from_millis(500)) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whiteboard_keys_split_once() {
        let key = whiteboard_key("web:config.port").unwrap();
        assert_eq!(key.job, "web");
        assert_eq!(key.key, "config.port");
        assert!(whiteboard_key("no-colon").is_err());
    }
}
