use crate::protocol::{Request, Response};
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Amqp(#[from] lapin::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("request timed out waiting for a reply")]
    Timeout,
    #[error("{0}")]
    Remote(String),
}

/// RPC caller over the same broker protocol `NodeDispatcher` serves.
/// Publishes to `<queue_prefix>_<node_id>`, waits on a private,
/// auto-delete reply queue keyed by a fresh correlation id. Grounded on
/// `original_source/trilio_dms/client.py`.
pub struct Client {
    channel: Channel,
    queue_prefix: String,
    timeout: Duration,
}

impl Client {
    pub async fn connect(amqp_url: &str, queue_prefix: impl Into<String>, timeout: Duration) -> Result<Self, Error> {
        let connection =
            Connection::connect(amqp_url, lapin::ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;
        Ok(Self {
            channel,
            queue_prefix: queue_prefix.into(),
            timeout,
        })
    }

    async fn call(&self, node_id: &str, request: &Request) -> Result<Response, Error> {
        let reply_queue = self
            .channel
            .queue_declare(
                "",
                QueueDeclareOptions {
                    exclusive: true,
                    auto_delete: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        let correlation_id = Uuid::new_v4().to_string();
        let body = serde_json::to_vec(request)?;
        let queue_name = format!("{}_{}", self.queue_prefix, node_id);

        let props = BasicProperties::default()
            .with_reply_to(reply_queue.name().clone())
            .with_correlation_id(correlation_id.clone().into());

        self.channel
            .basic_publish("", &queue_name, BasicPublishOptions::default(), &body, props)
            .await?;

        let mut consumer = self
            .channel
            .basic_consume(
                reply_queue.name().as_str(),
                &format!("dms-client-{correlation_id}"),
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        let wait = async {
            while let Some(delivery) = consumer.next().await {
                let delivery = delivery?;
                let matches = delivery
                    .properties
                    .correlation_id()
                    .map(|c| c.as_str() == correlation_id)
                    .unwrap_or(false);

                self.channel
                    .basic_ack(delivery.delivery_tag, BasicAckOptions::default())
                    .await?;

                if matches {
                    let response: Response = serde_json::from_slice(&delivery.data)?;
                    return Ok(response);
                }
            }
            Err(Error::Timeout)
        };

        match tokio::time::timeout(self.timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout),
        }
    }

    pub async fn mount(
        &self,
        node_id: &str,
        job_id: i64,
        target_id: &str,
        token: &str,
    ) -> Result<String, Error> {
        let request = Request::Mount {
            node_id: node_id.to_string(),
            job_id,
            target_id: target_id.to_string(),
            token: token.to_string(),
        };
        let response = self.call(node_id, &request).await?;
        if !response.success {
            return Err(Error::Remote(response.message));
        }
        response
            .mount_path
            .ok_or_else(|| Error::Remote("server reported success without a mount path".into()))
    }

    pub async fn unmount(&self, node_id: &str, job_id: i64, target_id: &str) -> Result<(), Error> {
        let request = Request::Unmount {
            node_id: node_id.to_string(),
            job_id,
            target_id: target_id.to_string(),
        };
        let response = self.call(node_id, &request).await?;
        if !response.success {
            return Err(Error::Remote(response.message));
        }
        Ok(())
    }
}

/// RAII wrapper scoping a mount to the lifetime of the guard, matching
/// `original_source/trilio_dms/context_manager.py`'s `MountContext`. `Drop`
/// cannot be `async`, so it only makes a best-effort, logged attempt to
/// unmount by spawning a detached task; callers that need to observe
/// unmount failures should call `release` explicitly instead of letting the
/// guard simply go out of scope.
pub struct MountGuard {
    client: std::sync::Arc<Client>,
    node_id: String,
    job_id: i64,
    target_id: String,
    mount_path: String,
    released: bool,
}

impl MountGuard {
    pub async fn acquire(
        client: std::sync::Arc<Client>,
        node_id: impl Into<String>,
        job_id: i64,
        target_id: impl Into<String>,
        token: &str,
    ) -> Result<Self, Error> {
        let node_id = node_id.into();
        let target_id = target_id.into();
        let mount_path = client.mount(&node_id, job_id, &target_id, token).await?;
        Ok(Self {
            client,
            node_id,
            job_id,
            target_id,
            mount_path,
            released: false,
        })
    }

    pub fn mount_path(&self) -> &str {
        &self.mount_path
    }

    /// explicitly unmounts and consumes the guard, surfacing any failure.
    pub async fn release(mut self) -> Result<(), Error> {
        self.released = true;
        self.client
            .unmount(&self.node_id, self.job_id, &self.target_id)
            .await
    }
}

impl Drop for MountGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let client = self.client.clone();
        let node_id = self.node_id.clone();
        let job_id = self.job_id;
        let target_id = self.target_id.clone();
        tokio::spawn(async move {
            if let Err(e) = client.unmount(&node_id, job_id, &target_id).await {
                log::warn!(
                    "best-effort unmount on drop failed for target {}: {}",
                    target_id,
                    e
                );
            }
        });
    }
}
