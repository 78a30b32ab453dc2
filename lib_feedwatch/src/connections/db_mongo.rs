//! # MongoDB Change Feed Connector
//!
//! Opens a database-wide change stream against a MongoDB deployment using the
//! official `mongodb` driver. Each subscription owns its own `Client`, so
//! closing a feed shuts that client down without touching other channels.

use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::StreamExt;
use log::{debug, info};
use mongodb::bson::Document;
use mongodb::change_stream::ChangeStream;
use mongodb::options::{ClientOptions, FullDocumentType};
use mongodb::Client;

use crate::canonical::RawRecord;
use crate::core::feed::{ChangeFeed, FeedConnector, TargetDescriptor};
use crate::errors::FeedError;

/// Default server selection timeout for new connections.
pub const DEFAULT_SERVER_SELECTION_TIMEOUT: Duration = Duration::from_secs(5);

/// Connector that opens live MongoDB change streams.
#[derive(Debug, Clone)]
pub struct MongoConnector {
    /// How long the driver may spend finding a usable server.
    pub server_selection_timeout: Duration,
}

impl Default for MongoConnector {
    fn default() -> Self {
        Self {
            server_selection_timeout: DEFAULT_SERVER_SELECTION_TIMEOUT,
        }
    }
}

impl MongoConnector {
    /// Creates a connector with a custom server selection timeout.
    pub fn new(server_selection_timeout: Duration) -> Self {
        Self { server_selection_timeout }
    }

    async fn connect(target: TargetDescriptor, timeout: Duration) -> Result<Box<dyn ChangeFeed>, FeedError> {
        let redacted = target.redacted_uri();
        debug!("Connecting to {} (database '{}')", redacted, target.database);

        let mut options = ClientOptions::parse(target.uri.as_str())
            .await
            .map_err(|e| FeedError::connect(e.to_string()))?;
        options.server_selection_timeout = Some(timeout);
        let client = Client::with_options(options).map_err(|e| FeedError::connect(e.to_string()))?;

        // Opening the stream is the first round trip, so server selection and
        // auth failures surface here.
        let opened = client
            .database(&target.database)
            .watch()
            .full_document(FullDocumentType::UpdateLookup)
            .await;
        let stream = match opened {
            Ok(stream) => stream.with_type::<Document>(),
            Err(e) => {
                client.shutdown().await;
                return Err(FeedError::connect(e.to_string()));
            }
        };

        info!("Change stream open on {} (database '{}')", redacted, target.database);
        Ok(Box::new(MongoFeed { client, stream }))
    }
}

impl FeedConnector for MongoConnector {
    fn open(&self, target: &TargetDescriptor) -> BoxFuture<'static, Result<Box<dyn ChangeFeed>, FeedError>> {
        Box::pin(Self::connect(target.clone(), self.server_selection_timeout))
    }
}

/// One open change stream plus the client that owns it.
struct MongoFeed {
    client: Client,
    stream: ChangeStream<Document>,
}

impl ChangeFeed for MongoFeed {
    fn next_record(&mut self) -> BoxFuture<'_, Option<Result<RawRecord, FeedError>>> {
        Box::pin(async move {
            self.stream
                .next()
                .await
                .map(|item| item.map_err(|e| FeedError::transport(e.to_string())))
        })
    }

    fn close(self: Box<Self>) -> BoxFuture<'static, ()> {
        let MongoFeed { client, stream } = *self;
        Box::pin(async move {
            // Shutdown waits for outstanding cursors, so the stream goes first.
            drop(stream);
            client.shutdown().await;
        })
    }
}
