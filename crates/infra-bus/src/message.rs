//! Named, parameterized bus messages.
//!
//! A [`Message`] is created by a producer, mutated by handlers in delivery
//! order and either destroyed after the final handler (dispatch) or consumed
//! from the queue (enqueue). Parameters keep their insertion order; handlers
//! communicate results back through [`Message::ret_value`].

use std::any::Any;
use std::sync::Arc;

use crate::clock;

/// Opaque shared payload attached to a message.
///
/// The canonical way to hand a live object (typically a channel) from one
/// handler to the next. Receivers recover the concrete type with
/// [`Message::user_data_as`].
pub type UserData = dyn Any + Send + Sync;

/// A named event travelling over the [`MessageBus`](crate::bus::MessageBus).
pub struct Message {
    name: String,
    params: Vec<(String, String)>,
    ret_value: String,
    user_data: Option<Arc<UserData>>,
    msg_time: u64,
}

impl Message {
    /// Creates a message with the given name and no parameters.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
            ret_value: String::new(),
            user_data: None,
            msg_time: clock::now_usecs(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Renames the message in place, keeping parameters, user-data and
    /// return value. This is the masquerade primitive.
    pub fn rename(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    /// Creation or last dispatch time, microseconds since the epoch.
    pub fn msg_time(&self) -> u64 {
        self.msg_time
    }

    pub(crate) fn touch(&mut self) {
        self.msg_time = clock::now_usecs();
    }

    pub fn params(&self) -> &[(String, String)] {
        &self.params
    }

    /// Value of the named parameter, if present.
    pub fn get_value(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Integer value of the named parameter, or `defvalue` when absent or
    /// unparsable.
    pub fn get_int_value(&self, name: &str, defvalue: i64) -> i64 {
        self.get_value(name)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(defvalue)
    }

    /// Boolean value of the named parameter, or `defvalue` when absent or
    /// not a recognized boolean word.
    pub fn get_bool_value(&self, name: &str, defvalue: bool) -> bool {
        self.get_value(name)
            .and_then(parse_bool)
            .unwrap_or(defvalue)
    }

    /// Sets the named parameter, replacing an existing value in place so the
    /// original position is kept.
    pub fn set_param(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.params.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = value,
            None => self.params.push((name, value)),
        }
    }

    /// Appends a parameter without replacing earlier ones of the same name.
    pub fn add_param(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.params.push((name.into(), value.into()));
    }

    /// Removes every parameter with the given name.
    pub fn clear_param(&mut self, name: &str) {
        self.params.retain(|(n, _)| n != name);
    }

    pub fn ret_value(&self) -> &str {
        &self.ret_value
    }

    pub fn ret_value_mut(&mut self) -> &mut String {
        &mut self.ret_value
    }

    pub fn user_data(&self) -> Option<Arc<UserData>> {
        self.user_data.clone()
    }

    pub fn set_user_data(&mut self, data: Option<Arc<UserData>>) {
        self.user_data = data;
    }

    /// Downcasts the user-data payload to a concrete shared type.
    pub fn user_data_as<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.user_data.clone().and_then(|d| d.downcast::<T>().ok())
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("name", &self.name)
            .field("params", &self.params)
            .field("ret_value", &self.ret_value)
            .field("has_user_data", &self.user_data.is_some())
            .finish()
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "enable" | "enabled" => Some(true),
        "false" | "no" | "off" | "disable" | "disabled" => Some(false),
        _ => None,
    }
}
