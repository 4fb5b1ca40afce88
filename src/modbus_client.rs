use std::fmt::{Debug, Display};
use std::time::Duration;
use tokio::net::lookup_host;
use tokio::sync::{watch, Mutex, MutexGuard};
use tokio::time::{error::Elapsed, timeout};
use tokio_modbus::prelude::*;
use tracing::{debug, info, instrument};

use crate::config::Config;
use crate::decode::decode_value;
use crate::error::{BridgeError, Result};
use crate::registers::{RegisterDescriptor, SIGNATURE, SIGNATURE_ADDR};
use crate::snapshot::RegisterValue;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Wire address for a documented (1-based) register address.
pub fn wire_address(address: u16, register_offset: i8) -> Result<u16> {
    let wire = i32::from(address) + i32::from(register_offset) - 1;
    u16::try_from(wire).map_err(|_| {
        BridgeError::Configuration(format!(
            "register {address} with offset {register_offset} is outside the address space"
        ))
    })
}

/// Single Modbus-TCP session to one E3/DC.
///
/// The session lives behind one async mutex, which doubles as the gate that
/// keeps exactly one request on the wire at a time. The connection is opened
/// lazily and dropped after any transport failure so the next request
/// reconnects.
pub struct ModbusClient {
    host: String,
    port: u16,
    unit_id: u8,
    register_offset: i8,
    connection: Mutex<Option<client::Context>>,
    closed: watch::Sender<bool>,
}

impl ModbusClient {
    pub fn new(host: impl Into<String>, port: u16, unit_id: u8, register_offset: i8) -> Self {
        Self {
            host: host.into(),
            port,
            unit_id,
            register_offset,
            connection: Mutex::new(None),
            closed: watch::channel(false).0,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.host.clone(),
            config.port,
            config.unit_id,
            config.register_offset,
        )
    }

    pub fn register_offset(&self) -> i8 {
        self.register_offset
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Opens the session unless it is already open.
    pub async fn connect(&self) -> Result<()> {
        let mut connection = self.acquire().await?;
        self.ensure_connected(&mut connection).await?;
        Ok(())
    }

    pub async fn read_holding_registers(&self, address: u16, count: u16) -> Result<Vec<u16>> {
        let wire = wire_address(address, self.register_offset)?;
        let mut connection = self.acquire().await?;
        let context = self.ensure_connected(&mut connection).await?;

        let result = timeout(REQUEST_TIMEOUT, context.read_holding_registers(wire, count)).await;
        let words = settle(&mut connection, address, result)?;
        drop(connection);

        if words.len() != usize::from(count) {
            return Err(BridgeError::protocol(
                address,
                format!("read {} words while expecting {}", words.len(), count),
            ));
        }
        Ok(words)
    }

    pub async fn write_register(&self, address: u16, value: u16) -> Result<()> {
        let wire = wire_address(address, self.register_offset)?;
        let mut connection = self.acquire().await?;
        let context = self.ensure_connected(&mut connection).await?;

        let result = timeout(REQUEST_TIMEOUT, context.write_single_register(wire, value)).await;
        settle(&mut connection, address, result)?;
        debug!("Wrote {value:#06x} to register {address} (wire {wire})");
        Ok(())
    }

    /// Reads and decodes one described register.
    #[instrument(level = "trace", skip_all, fields(register = descriptor.name))]
    pub async fn read_value(&self, descriptor: &RegisterDescriptor) -> Result<RegisterValue> {
        let words = self
            .read_holding_registers(descriptor.address, descriptor.words)
            .await?;
        decode_value(descriptor, &words)
    }

    /// Checks that the other end is an E3/DC in Simple Mode.
    pub async fn verify_signature(&self) -> Result<()> {
        let words = self
            .read_holding_registers(SIGNATURE_ADDR, 1)
            .await
            .map_err(|err| match err {
                BridgeError::Protocol { reason, .. } => BridgeError::Connectivity(format!(
                    "signature register could not be read: {reason}"
                )),
                other => other,
            })?;
        match words.first() {
            Some(&SIGNATURE) => Ok(()),
            Some(other) => Err(BridgeError::Validation(format!(
                "not an E3/DC device, signature register holds {other:#06x}"
            ))),
            None => Err(BridgeError::Validation("empty signature register".into())),
        }
    }

    /// Setup-time probe: connect with a throwaway client, check the signature, close.
    pub async fn probe(config: &Config) -> Result<()> {
        let client = Self::from_config(config);
        let result = client.verify_signature().await;
        client.close().await;
        result
    }

    /// Tears the session down. Pending and future requests fail with a
    /// connectivity error. Calling it again is a no-op.
    pub async fn close(&self) {
        let already_closed = self.closed.send_replace(true);
        let mut connection = self.connection.lock().await;
        if let Some(mut context) = connection.take() {
            if let Err(err) = context.disconnect().await {
                debug!("Error while disconnecting from {}: {err}", self.host);
            }
            info!("Closed Modbus session to {}:{}", self.host, self.port);
        } else if !already_closed {
            debug!("Modbus client for {} closed without an open session", self.host);
        }
    }

    /// Waits for the gate, giving up as soon as the client is closed.
    async fn acquire(&self) -> Result<MutexGuard<'_, Option<client::Context>>> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow_and_update() {
            return Err(closed_error());
        }

        let guard = tokio::select! {
            guard = self.connection.lock() => guard,
            _ = wait_until_set(&mut closed) => return Err(closed_error()),
        };
        // close() may have won the race for the lock
        if self.is_closed() {
            return Err(closed_error());
        }
        Ok(guard)
    }

    async fn ensure_connected<'a>(
        &self,
        connection: &'a mut Option<client::Context>,
    ) -> Result<&'a mut client::Context> {
        if connection.is_none() {
            *connection = Some(self.open().await?);
        }
        connection
            .as_mut()
            .ok_or_else(|| BridgeError::Connectivity("no session".into()))
    }

    async fn open(&self) -> Result<client::Context> {
        let target = lookup_host((self.host.as_str(), self.port))
            .await
            .map_err(|e| BridgeError::Connectivity(format!("cannot resolve {}: {e}", self.host)))?
            .next()
            .ok_or_else(|| BridgeError::Connectivity(format!("no address for {}", self.host)))?;

        let context = timeout(CONNECT_TIMEOUT, tcp::connect_slave(target, Slave(self.unit_id)))
            .await
            .map_err(|_| BridgeError::Connectivity(format!("connecting to {target} timed out")))?
            .map_err(|e| BridgeError::Connectivity(format!("connecting to {target}: {e}")))?;

        info!("Connected to E3/DC at {target} (unit {})", self.unit_id);
        Ok(context)
    }
}

/// Turns a timed request into our error taxonomy. Timeouts and transport
/// errors leave the session in an unknown state, so it is dropped.
fn settle<T, X: Debug, E: Display>(
    connection: &mut Option<client::Context>,
    address: u16,
    result: std::result::Result<std::result::Result<std::result::Result<T, X>, E>, Elapsed>,
) -> Result<T> {
    match result {
        Ok(Ok(Ok(value))) => Ok(value),
        Ok(Ok(Err(exception))) => Err(BridgeError::protocol(
            address,
            format!("Modbus exception: {exception:?}"),
        )),
        Ok(Err(err)) => {
            *connection = None;
            Err(BridgeError::protocol(address, format!("transport error: {err}")))
        }
        Err(_) => {
            *connection = None;
            Err(BridgeError::protocol(address, "request timed out"))
        }
    }
}

/// Resolves once the flag behind `flag` is true or its sender is gone.
pub(crate) async fn wait_until_set(flag: &mut watch::Receiver<bool>) {
    loop {
        let is_set = *flag.borrow_and_update();
        if is_set || flag.changed().await.is_err() {
            return;
        }
    }
}

fn closed_error() -> BridgeError {
    BridgeError::Connectivity("client closed".into())
}
