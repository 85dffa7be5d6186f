use pgpipe::{Client, Event, Query, Result};
use tracing::{Instrument, trace_span};

pub async fn main() -> Result<()> {
    // will read the `DATABASE_URL` environment variable
    let client = Client::connect_env().await?;
    let mut events = client.events();
    let mut handles = vec![];

    client.query("DROP TABLE IF EXISTS post").await?;

    client.query("CREATE TABLE post(id serial, name text)").await?;

    for id in 0..24 {
        // cloning client is cheap, every clone queue into the same connection
        let client = client.clone();

        handles.push(tokio::spawn(async move {
            client
                .query(Query::new("INSERT INTO post(name) VALUES($1)").bind(format!("thread{id}")))
                .await
        }.instrument(trace_span!("thread",id))));
    }

    for h in handles {
        h.await.unwrap()?;
    }

    let posts = client.query("SELECT name FROM post").await?;

    assert!(posts.rows().iter().any(|e| e.try_get::<_, String>("name").as_deref() == Ok("thread23")));
    assert_eq!(posts.rows().len(), 24);

    client.query("LISTEN jobs").await?;
    client.query("NOTIFY jobs, 'done'").await?;

    while let Some(event) = events.recv().await {
        if let Event::Notification { channel, payload, .. } = event {
            assert_eq!(&*channel, "jobs");
            assert_eq!(&*payload, "done");
            break;
        }
    }

    client.end().await
}
