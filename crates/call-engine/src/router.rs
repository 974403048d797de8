//! Routing tasks: one short-lived task per inbound call.

use std::sync::Arc;

use rpbx_infra_bus::{Message, UserData};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::driver::Driver;
use crate::module::Module;

/// Executes the routing state machine for one inbound call.
///
/// The router owns the routing message for its whole life. A run ends in
/// exactly one of `call_accept` or `call_rejected` on the channel, unless
/// the channel vanished while the routing message was out on the bus.
pub struct Router {
    driver: Arc<Driver>,
    chan_id: String,
    msg: Message,
}

impl Router {
    /// Spawns the routing task for channel `chan_id`.
    pub fn spawn(driver: Arc<Driver>, chan_id: String, msg: Message) -> JoinHandle<()> {
        tokio::spawn(async move {
            Router {
                driver,
                chan_id,
                msg,
            }
            .run()
            .await;
        })
    }

    async fn run(mut self) {
        self.driver.routing_started();
        let routed = self.route().await;
        self.driver.routing_finished(routed);
    }

    async fn route(&mut self) -> bool {
        debug!("routing call '{}'", self.chan_id);

        // a pre-set callto skips the routing dispatch entirely
        let callto = self.msg.get_value("callto").unwrap_or("").to_string();
        let mut ok = !callto.is_empty();
        if ok {
            *self.msg.ret_value_mut() = callto;
        } else {
            ok = self.driver.module().bus().dispatch(&mut self.msg).await;
        }

        let Some(chan) = self.driver.find(&self.chan_id) else {
            info!("connection '{}' vanished while routing", self.chan_id);
            return false;
        };
        // our own reference outlives any user-data rebinds by handlers
        self.msg.set_user_data(Some(chan.clone() as Arc<UserData>));

        let mut accepted = false;
        if ok {
            if self.msg.ret_value() == "-" {
                let error = self.msg.get_value("error").unwrap_or("unknown").to_string();
                let reason = self.msg.get_value("reason").map(String::from);
                chan.call_rejected(&error, reason.as_deref(), Some(&self.msg));
            } else if self.msg.get_int_value("antiloop", 1) <= 0 {
                let error = self.msg.get_value("error").unwrap_or("looping").to_string();
                let reason = self
                    .msg
                    .get_value("reason")
                    .unwrap_or("Call is looping")
                    .to_string();
                chan.call_rejected(&error, Some(&reason), Some(&self.msg));
            } else if chan.call_routed(&self.msg) {
                let target = self.msg.ret_value().to_string();
                self.msg.rename("call.execute");
                self.msg.set_param("callto", target);
                self.msg.clear_param("error");
                self.msg.ret_value_mut().clear();
                let connected = self.driver.module().bus().dispatch(&mut self.msg).await;
                if connected {
                    chan.call_accept(&self.msg);
                    accepted = true;
                } else {
                    let error = self.msg.get_value("error").unwrap_or("noconn").to_string();
                    let reason = self
                        .msg
                        .get_value("reason")
                        .unwrap_or("Could not connect to target")
                        .to_string();
                    chan.call_rejected(&error, Some(&reason), Some(&self.msg));
                }
            }
        } else {
            let error = self.msg.get_value("error").unwrap_or("noroute").to_string();
            let reason = self
                .msg
                .get_value("reason")
                .unwrap_or("No route to call target")
                .to_string();
            chan.call_rejected(&error, Some(&reason), Some(&self.msg));
        }

        // a dynamic channel that did not become a call dies with its router
        if !accepted && self.driver.varchan() {
            chan.release().await;
        }
        accepted
    }
}
