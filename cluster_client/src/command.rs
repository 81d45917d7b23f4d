//! The `Command` trait: a typed request/response pair plus the hash
//! slots it touches, so the cluster client can route and decode
//! without the caller hand-matching on `Token`.

use crate::error::{ClientError, ClientResult};
use crate::hash_slot::{slot_for_key, HashSlot};
use crate::resp::Token;

/// Converts a decoded reply into a Rust value, mirroring `FromRedis`.
pub trait FromToken: Sized {
    fn from_token(token: Token) -> ClientResult<Self>;
}

impl FromToken for Token {
    fn from_token(token: Token) -> ClientResult<Self> {
        Ok(token)
    }
}

impl FromToken for String {
    fn from_token(token: Token) -> ClientResult<Self> {
        match token.strip_attribute() {
            Token::BlobString(b) => Ok(String::from_utf8_lossy(b).into_owned()),
            Token::SimpleString(s) => Ok(s.clone()),
            Token::SimpleError(msg) | Token::BlobError(msg) => {
                Err(ClientError::CommandError(msg.clone()))
            }
            other => Err(ClientError::CommandError(format!(
                "cannot convert {other:?} to String"
            ))),
        }
    }
}

impl FromToken for i64 {
    fn from_token(token: Token) -> ClientResult<Self> {
        match token.strip_attribute() {
            Token::Number(n) => Ok(*n),
            Token::SimpleError(msg) | Token::BlobError(msg) => {
                Err(ClientError::CommandError(msg.clone()))
            }
            other => Err(ClientError::CommandError(format!(
                "cannot convert {other:?} to i64"
            ))),
        }
    }
}

impl FromToken for bool {
    fn from_token(token: Token) -> ClientResult<Self> {
        match token.strip_attribute() {
            Token::Boolean(b) => Ok(*b),
            Token::Number(n) => Ok(*n != 0),
            other => Err(ClientError::CommandError(format!(
                "cannot convert {other:?} to bool"
            ))),
        }
    }
}

impl<T: FromToken> FromToken for Option<T> {
    fn from_token(token: Token) -> ClientResult<Self> {
        match token.strip_attribute() {
            Token::Null => Ok(None),
            _ => T::from_token(token).map(Some),
        }
    }
}

impl<T: FromToken> FromToken for Vec<T> {
    fn from_token(token: Token) -> ClientResult<Self> {
        match token.strip_attribute() {
            Token::Array(items) | Token::Set(items) | Token::Push(items) => {
                items.iter().cloned().map(T::from_token).collect()
            }
            other => Err(ClientError::CommandError(format!(
                "cannot convert {other:?} to Vec"
            ))),
        }
    }
}

/// Anything that can be sent to a node: its argument vector and the keys
/// it touches, used to compute routing slots. Object-safe on its own so
/// heterogeneous pipelines can hold `&dyn Encodable`.
pub trait Encodable: Send + Sync {
    fn command_args(&self) -> Vec<Vec<u8>>;

    /// Keys this command reads or writes, for slot routing. Commands
    /// with no keys (PING, CLUSTER SHARDS) return an empty vec.
    fn keys_affected(&self) -> Vec<Vec<u8>> {
        vec![]
    }

    /// The single hash slot all of `keys_affected` must share, or
    /// `None` if the command carries no keys. Returns an error if the
    /// keys span more than one slot (`keys_require_multiple_hash_slots`).
    fn routing_slot(&self) -> ClientResult<Option<HashSlot>> {
        let keys = self.keys_affected();
        let mut slot = None;
        for key in &keys {
            let candidate = slot_for_key(key);
            match slot {
                None => slot = Some(candidate),
                Some(existing) if existing == candidate => {}
                Some(_) => return Err(ClientError::KeysRequireMultipleHashSlots),
            }
        }
        Ok(slot)
    }
}

/// A typed command: its wire encoding plus how to decode its reply.
pub trait Command: Encodable {
    type Response: FromToken;

    fn decode(&self, token: Token) -> ClientResult<Self::Response> {
        if let Some(msg) = token.error_message() {
            return Err(ClientError::CommandError(msg.to_string()));
        }
        Self::Response::from_token(token)
    }
}

macro_rules! simple_command {
    ($name:ident, $response:ty, $cmd:expr) => {
        pub struct $name(pub Vec<Vec<u8>>);

        impl Encodable for $name {
            fn command_args(&self) -> Vec<Vec<u8>> {
                let mut args = vec![$cmd.as_bytes().to_vec()];
                args.extend(self.0.iter().cloned());
                args
            }

            fn keys_affected(&self) -> Vec<Vec<u8>> {
                self.0.clone()
            }
        }

        impl Command for $name {
            type Response = $response;
        }
    };
}

/// `GET key`.
pub struct Get(pub Vec<u8>);

impl Encodable for Get {
    fn command_args(&self) -> Vec<Vec<u8>> {
        vec![b"GET".to_vec(), self.0.clone()]
    }

    fn keys_affected(&self) -> Vec<Vec<u8>> {
        vec![self.0.clone()]
    }
}

impl Command for Get {
    type Response = Option<String>;
}

/// `SET key value`.
pub struct Set(pub Vec<u8>, pub Vec<u8>);

impl Encodable for Set {
    fn command_args(&self) -> Vec<Vec<u8>> {
        vec![b"SET".to_vec(), self.0.clone(), self.1.clone()]
    }

    fn keys_affected(&self) -> Vec<Vec<u8>> {
        vec![self.0.clone()]
    }
}

impl Command for Set {
    type Response = String;
}

simple_command!(Del, i64, "DEL");
simple_command!(Exists, i64, "EXISTS");

/// `MGET key...`: every key must share one slot — a multi-key command
/// whose hash-tag discipline is the caller's responsibility.
pub struct MGet(pub Vec<Vec<u8>>);

impl Encodable for MGet {
    fn command_args(&self) -> Vec<Vec<u8>> {
        let mut args = vec![b"MGET".to_vec()];
        args.extend(self.0.iter().cloned());
        args
    }

    fn keys_affected(&self) -> Vec<Vec<u8>> {
        self.0.clone()
    }
}

impl Command for MGet {
    type Response = Vec<Option<String>>;
}

/// `PING`: no keys, routed to an arbitrary node.
pub struct Ping;

impl Encodable for Ping {
    fn command_args(&self) -> Vec<Vec<u8>> {
        vec![b"PING".to_vec()]
    }
}

impl Command for Ping {
    type Response = String;
}
