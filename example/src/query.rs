use pgpipe::{Client, ErrorClass, Query, Result, postgres::TransactionStatus};

pub async fn main() -> Result<()> {
    let client = Client::connect_env().await?;

    // Simple protocol

    client.query("CREATE TEMP TABLE pgpipe(id serial, name text)").await?;

    let result = client
        .query(Query::new("INSERT INTO pgpipe(name) VALUES($1)").bind("Deez"))
        .await?;

    assert_eq!(result.row_count(), Some(1));

    client.query("INSERT INTO pgpipe(name) VALUES('Foo'); INSERT INTO pgpipe(name) VALUES('Bar')").await?;

    // Multiple result sets

    let result = client.query("SELECT id FROM pgpipe; SELECT name FROM pgpipe").await?;
    assert_eq!(result.result_sets().len(), 2);

    // Prepared statement, parsed once

    for id in 1..=3 {
        let result = client
            .query(Query::new("SELECT id, name FROM pgpipe WHERE id = $1").bind(id).name("by_id"))
            .await?;
        let (found, _name) = result.rows()[0].clone().decode::<(i32, String)>()?;
        assert_eq!(found, id);
    }

    // same name, different text
    let err = client
        .query(Query::new("SELECT name FROM pgpipe").name("by_id"))
        .await
        .unwrap_err();
    assert_eq!(err.class(), ErrorClass::NotSent);

    client.close_statement("by_id").await?;
    client.query(Query::new("SELECT name FROM pgpipe").name("by_id")).await?;

    // Row limited fetch

    let result = client
        .query(Query::new("SELECT * FROM generate_series(1, 10)").rows(3))
        .await?;
    assert_eq!(result.rows().len(), 10);

    // Pipelining

    let (a, b, c) = tokio::join!(
        client.query("SELECT 'a'"),
        client.query("SELECT foo"),
        client.query("SELECT 'c'"),
    );
    assert_eq!(a?.rows()[0].try_get::<_, String>(0)?, "a");
    assert_eq!(b.unwrap_err().class(), ErrorClass::Rejected);
    assert_eq!(c?.rows()[0].try_get::<_, String>(0)?, "c");

    // Transaction

    client.query("BEGIN").await?;
    assert_eq!(client.transaction_status(), TransactionStatus::InTransaction);
    client.query("SELECT foo").await.unwrap_err();
    assert_eq!(client.transaction_status(), TransactionStatus::Failed);
    client.query("ROLLBACK").await?;

    // Error case

    client.query("").await?;
    client.query("SELECT foo").await.unwrap_err();

    client.end().await
}
