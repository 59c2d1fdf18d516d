use log::info;
use mongodb::{options::ClientOptions, Client, Database};

pub struct MongoDB {
    pub client: Client,
    pub db: Database,
}

impl MongoDB {
    /// Builds the client and selects the application database. Connections
    /// are established lazily on first use, so this only fails on a
    /// malformed connection string.
    pub async fn init(uri: &str, db_name: &str) -> mongodb::error::Result<Self> {
        let mut client_options = ClientOptions::parse(uri).await?;
        client_options.app_name = Some("flowboard".to_string());
        let client = Client::with_options(client_options)?;
        let db = client.database(db_name);
        info!("MongoDB client ready for database '{}'", db_name);
        Ok(MongoDB { client, db })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn init_accepts_a_standard_connection_string() {
        let mongodb = MongoDB::init("mongodb://localhost:27017", "flowboard")
            .await
            .unwrap();
        assert_eq!(mongodb.db.name(), "flowboard");
    }

    #[tokio::test]
    async fn init_rejects_a_malformed_connection_string() {
        assert!(MongoDB::init("localhost:27017", "flowboard").await.is_err());
    }
}
