use crate::driver::MountDriver;
use crate::error::DmsError;
use crate::external::{CredentialSource, TokenVerifier};
use crate::ledger::Ledger;
use crate::protocol::{Request, Response};
use crate::serializer::Serializer;
use crate::service::MountService;
use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
    BasicQosOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Amqp(#[from] lapin::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// anything able to turn a wire `Request` into a `Response`. `MountService`
/// is the only production implementation; the trait exists so
/// `NodeDispatcher` can be unit tested against a fake handler without a
/// live broker.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, request: Request) -> Response;
}

#[async_trait]
impl<L: Ledger, NF: MountDriver, UF: MountDriver, C: CredentialSource, V: TokenVerifier> RequestHandler
    for MountService<L, NF, UF, C, V>
{
    async fn handle(&self, request: Request) -> Response {
        match request {
            Request::Mount {
                job_id,
                target_id,
                token,
                ..
            } => match self.mount(job_id, &target_id, &token).await {
                Ok(outcome) => Response::mount_ok(
                    "",
                    outcome.mount_path,
                    outcome.reused_existing,
                    outcome.physically_mounted,
                ),
                Err(e) => Response::err("", e.to_string(), e.code()),
            },
            Request::Unmount {
                job_id, target_id, ..
            } => match self.unmount(job_id, &target_id).await {
                Ok(outcome) => Response::unmount_ok(
                    "",
                    outcome.physically_unmounted,
                    outcome.active_mounts_remaining,
                ),
                Err(e) => Response::err("", e.to_string(), e.code()),
            },
        }
    }
}

/// consumes this node's durable queue and dispatches each request to a
/// `RequestHandler`, matching `original_source/trilio_dms/messaging/rabbitmq.py`:
/// a durable queue named `<prefix>_<node_id>` with a 1 hour TTL,
/// `prefetch_count=1`, node-id validation with nack-without-requeue on
/// mismatch, and a reply published to `reply_to`/`correlation_id` when
/// present.
pub struct NodeDispatcher<H: RequestHandler> {
    channel: Channel,
    queue_name: String,
    node_id: String,
    handler: H,
    serializer: Serializer,
}

impl<H: RequestHandler> NodeDispatcher<H> {
    pub async fn connect(
        amqp_url: &str,
        queue_prefix: &str,
        node_id: impl Into<String>,
        prefetch: u16,
        handler: H,
        serializer: Serializer,
    ) -> Result<Self, Error> {
        let node_id = node_id.into();
        let queue_name = format!("{queue_prefix}_{node_id}");

        let connection =
            Connection::connect(amqp_url, lapin::ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;

        let mut args = FieldTable::default();
        args.insert("x-message-ttl".into(), AMQPValue::LongUInt(3_600_000));

        channel
            .queue_declare(&queue_name, QueueDeclareOptions { durable: true, ..Default::default() }, args)
            .await?;

        channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await?;

        Ok(Self {
            channel,
            queue_name,
            node_id,
            handler,
            serializer,
        })
    }

    /// consumes until the channel closes. Each message is acknowledged after
    /// a reply is published (or, on a node-id mismatch, nacked without
    /// requeue so it doesn't loop forever onto a queue it was never meant
    /// for).
    pub async fn run(&self) -> Result<(), Error> {
        let mut consumer = self
            .channel
            .basic_consume(
                &self.queue_name,
                "dms-consumer",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        while let Some(delivery) = consumer.next().await {
            let delivery = match delivery {
                Ok(d) => d,
                Err(e) => {
                    log::error!("consumer error on queue {}: {}", self.queue_name, e);
                    continue;
                }
            };

            if let Err(e) = self.handle_delivery(&delivery).await {
                log::error!("failed to handle delivery: {}", e);
            }
        }

        Ok(())
    }

    async fn handle_delivery(&self, delivery: &lapin::message::Delivery) -> Result<(), Error> {
        let request: Request = match serde_json::from_slice(&delivery.data) {
            Ok(req) => req,
            Err(e) => {
                log::error!("malformed request body: {}", e);
                self.channel
                    .basic_nack(delivery.delivery_tag, BasicNackOptions { requeue: false, ..Default::default() })
                    .await?;
                return Ok(());
            }
        };

        if request.node_id() != self.node_id {
            log::error!(
                "request addressed to node {} arrived on queue for node {}",
                request.node_id(),
                self.node_id
            );
            let response = Response::node_mismatch(&self.node_id, request.node_id());
            self.reply(delivery, &response).await?;
            self.channel
                .basic_nack(delivery.delivery_tag, BasicNackOptions { requeue: false, ..Default::default() })
                .await?;
            return Ok(());
        }

        // the file lock is the cross-process concurrency cap: prefetch=1
        // only serializes requests within this process, not across nodes'
        // worker processes sharing the same mount targets.
        let mut response = match self.serializer.acquire("mount_unmount").await {
            Ok(guard) => {
                let response = self.handler.handle(request).await;
                drop(guard);
                response
            }
            Err(crate::serializer::Error::Timeout(_, timeout)) => {
                let err = DmsError::LockTimeout(timeout);
                Response::err("", err.to_string(), err.code())
            }
            Err(e) => {
                let err = DmsError::from(e);
                Response::err("", err.to_string(), err.code())
            }
        };
        response.server_node_id = self.node_id.clone();

        self.reply(delivery, &response).await?;
        self.channel
            .basic_ack(delivery.delivery_tag, BasicAckOptions::default())
            .await?;
        Ok(())
    }

    async fn reply(
        &self,
        delivery: &lapin::message::Delivery,
        response: &Response,
    ) -> Result<(), Error> {
        let reply_to = match delivery.properties.reply_to() {
            Some(r) => r.as_str(),
            None => return Ok(()),
        };

        let mut props = BasicProperties::default();
        if let Some(correlation_id) = delivery.properties.correlation_id() {
            props = props.with_correlation_id(correlation_id.clone());
        }

        let body = serde_json::to_vec(response)?;
        self.channel
            .basic_publish("", reply_to, BasicPublishOptions::default(), &body, props)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::protocol::{Request, Response};

    struct EchoHandler;

    #[async_trait]
    impl RequestHandler for EchoHandler {
        async fn handle(&self, request: Request) -> Response {
            match request {
                Request::Mount { target_id, .. } => {
                    Response::mount_ok("node-1", format!("/mnt/trilio/{target_id}"), false, true)
                }
                Request::Unmount { .. } => Response::unmount_ok("node-1", true, 0),
            }
        }
    }

    #[tokio::test]
    async fn handler_builds_expected_mount_path() {
        let handler = EchoHandler;
        let response = handler
            .handle(Request::Mount {
                node_id: "node-1".into(),
                job_id: 1,
                target_id: "target-a".into(),
                token: "tok".into(),
            })
            .await;
        assert_eq!(response.mount_path.unwrap(), "/mnt/trilio/target-a");
    }
}
