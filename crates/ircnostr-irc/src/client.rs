//! IRC client and connection

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use irc::client::prelude::*;
use irc::client::ClientStream;
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use ircnostr_core::{BridgeError, ChatClient, ChatConnection, ChatMessage, ConnectionKey, Result};

use crate::error::IrcTransportError;

/// Messages buffered per channel for slow listeners
const CHANNEL_BUFFER: usize = 256;

const DEFAULT_REGISTRATION_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(30);
const QUIT_TIMEOUT: Duration = Duration::from_secs(2);

// ----------------------------------------------------------------------------
// Client
// ----------------------------------------------------------------------------

/// Opens IRC connections with the `irc` crate
#[derive(Debug, Clone)]
pub struct IrcClient {
    registration_timeout: Duration,
    join_timeout: Duration,
}

impl Default for IrcClient {
    fn default() -> Self {
        Self {
            registration_timeout: DEFAULT_REGISTRATION_TIMEOUT,
            join_timeout: DEFAULT_JOIN_TIMEOUT,
        }
    }
}

impl IrcClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeouts(registration_timeout: Duration, join_timeout: Duration) -> Self {
        Self {
            registration_timeout,
            join_timeout,
        }
    }

    fn config(key: &ConnectionKey) -> Config {
        Config {
            nickname: Some(key.nick.clone()),
            alt_nicks: vec![format!("{}_", key.nick), format!("{}__", key.nick)],
            username: Some(key.nick.clone()),
            realname: Some("IRC/Nostr bridge".to_string()),
            server: Some(key.server.clone()),
            port: Some(key.port),
            use_tls: Some(key.secure),
            ..Config::default()
        }
    }
}

#[async_trait]
impl ChatClient for IrcClient {
    async fn connect(&self, key: &ConnectionKey) -> Result<Arc<dyn ChatConnection>> {
        let connection_failed = |source| IrcTransportError::ConnectionFailed {
            server: key.server.clone(),
            source,
        };

        debug!("Connecting to {} as {}", key.uri(), key.nick);
        let mut client = Client::from_config(Self::config(key))
            .await
            .map_err(connection_failed)?;
        client.identify().map_err(connection_failed)?;
        let stream = client.stream().map_err(connection_failed)?;

        let state = Arc::new(ConnectionState::new(key.clone(), &key.nick));
        let (registered_tx, registered_rx) = oneshot::channel();
        let reader = tokio::spawn(read_messages(
            stream,
            client.sender(),
            state.clone(),
            registered_tx,
        ));

        let registration = timeout(self.registration_timeout, registered_rx).await;
        let failure = match registration {
            Ok(Ok(())) => None,
            Ok(Err(_)) => Some(IrcTransportError::ClosedDuringRegistration {
                server: key.server.clone(),
            }),
            Err(_) => Some(IrcTransportError::RegistrationTimeout {
                server: key.server.clone(),
            }),
        };
        if let Some(err) = failure {
            reader.abort();
            return Err(err.into());
        }

        info!("Registered with {} as {}", key.server, state.nick());
        Ok(Arc::new(IrcConnection {
            state,
            sender: client.sender(),
            reader: Mutex::new(Some(reader)),
            join_timeout: self.join_timeout,
        }))
    }
}

// ----------------------------------------------------------------------------
// Connection State
// ----------------------------------------------------------------------------

/// What the reader must do after a server message was dispatched
#[derive(Debug, PartialEq, Eq)]
enum Dispatch {
    None,
    Registered,
    Rejoin(String),
}

/// State shared between a connection and its reader task
struct ConnectionState {
    key: ConnectionKey,
    nick: Mutex<String>,
    channels: DashMap<String, broadcast::Sender<ChatMessage>>,
    pending_joins: DashMap<String, oneshot::Sender<Result<()>>>,
    link: watch::Sender<bool>,
}

impl ConnectionState {
    fn new(key: ConnectionKey, nick: &str) -> Self {
        Self {
            key,
            nick: Mutex::new(nick.to_string()),
            channels: DashMap::new(),
            pending_joins: DashMap::new(),
            link: watch::Sender::new(true),
        }
    }

    /// Nick the server registered us under
    fn nick(&self) -> String {
        self.nick
            .lock()
            .map(|n| n.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    fn set_nick(&self, nick: &str) {
        match self.nick.lock() {
            Ok(mut current) => *current = nick.to_string(),
            Err(poisoned) => *poisoned.into_inner() = nick.to_string(),
        }
    }

    fn is_open(&self) -> bool {
        *self.link.borrow()
    }

    fn is_own(&self, message: &Message) -> bool {
        message
            .source_nickname()
            .map(|n| n.eq_ignore_ascii_case(&self.nick()))
            .unwrap_or(false)
    }

    fn subscribe(&self, channel: &str) -> broadcast::Receiver<ChatMessage> {
        if !self.is_open() {
            return broadcast::channel(1).1;
        }
        self.channels
            .entry(channel.to_lowercase())
            .or_insert_with(|| broadcast::channel(CHANNEL_BUFFER).0)
            .subscribe()
    }

    fn finish_join(&self, channel: &str, result: Result<()>) {
        if let Some((_, pending)) = self.pending_joins.remove(&channel.to_lowercase()) {
            let _ = pending.send(result);
        }
    }

    fn dispatch(&self, message: &Message) -> Dispatch {
        match &message.command {
            Command::Response(Response::RPL_WELCOME, args) => {
                if let Some(nick) = args.first() {
                    self.set_nick(nick);
                }
            }
            Command::Response(Response::RPL_ENDOFMOTD, _)
            | Command::Response(Response::ERR_NOMOTD, _) => return Dispatch::Registered,
            Command::Response(
                Response::ERR_NOSUCHCHANNEL
                | Response::ERR_TOOMANYCHANNELS
                | Response::ERR_CHANNELISFULL
                | Response::ERR_INVITEONLYCHAN
                | Response::ERR_BANNEDFROMCHAN
                | Response::ERR_BADCHANNELKEY,
                args,
            ) => {
                if let Some(channel) = args.get(1) {
                    let reason = args.last().cloned().unwrap_or_default();
                    warn!("Server refused to join {}: {}", channel, reason);
                    self.finish_join(
                        channel,
                        Err(BridgeError::JoinFailed {
                            channel: channel.clone(),
                            reason,
                        }),
                    );
                }
            }
            Command::JOIN(channel, _, _) if self.is_own(message) => {
                self.finish_join(channel, Ok(()));
            }
            Command::KICK(channel, nick, reason) if nick.eq_ignore_ascii_case(&self.nick()) => {
                warn!(
                    "Kicked from {}: {}",
                    channel,
                    reason.as_deref().unwrap_or("no reason")
                );
                return Dispatch::Rejoin(channel.clone());
            }
            Command::PRIVMSG(target, text) => {
                let Some(sender) = message.source_nickname() else {
                    return Dispatch::None;
                };
                if !is_channel(target) {
                    return Dispatch::None;
                }
                if text.starts_with('\u{1}') {
                    debug!("Ignoring CTCP from {} in {}", sender, target);
                    return Dispatch::None;
                }
                if let Some(listeners) = self.channels.get(&target.to_lowercase()) {
                    let _ = listeners.send(ChatMessage::new(sender, text.clone()));
                }
            }
            Command::ERROR(reason) => {
                warn!("Server {} reported an error: {}", self.key.server, reason);
            }
            _ => {}
        }
        Dispatch::None
    }

    /// Mark the link as down and wake everyone waiting on it
    fn close(&self) {
        self.link.send_replace(false);
        self.channels.clear();
        self.pending_joins.clear();
    }
}

fn is_channel(target: &str) -> bool {
    target.starts_with('#') || target.starts_with('&')
}

async fn read_messages(
    mut stream: ClientStream,
    sender: Sender,
    state: Arc<ConnectionState>,
    registered: oneshot::Sender<()>,
) {
    let mut registered = Some(registered);

    loop {
        match stream.next().await {
            Some(Ok(message)) => match state.dispatch(&message) {
                Dispatch::Registered => {
                    if let Some(registered) = registered.take() {
                        let _ = registered.send(());
                    }
                }
                Dispatch::Rejoin(channel) => {
                    if let Err(err) = sender.send_join(&channel) {
                        warn!("Failed to rejoin {}: {}", channel, err);
                    }
                }
                Dispatch::None => {}
            },
            Some(Err(err)) => {
                warn!("Connection to {} failed: {}", state.key.uri(), err);
                break;
            }
            None => {
                debug!("Connection to {} ended", state.key.uri());
                break;
            }
        }
    }

    state.close();
}

// ----------------------------------------------------------------------------
// Connection
// ----------------------------------------------------------------------------

/// One registered IRC connection
pub struct IrcConnection {
    state: Arc<ConnectionState>,
    sender: Sender,
    reader: Mutex<Option<JoinHandle<()>>>,
    join_timeout: Duration,
}

impl IrcConnection {
    pub fn key(&self) -> &ConnectionKey {
        &self.state.key
    }

    fn take_reader(&self) -> Option<JoinHandle<()>> {
        match self.reader.lock() {
            Ok(mut reader) => reader.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }

    fn send_failed(&self, target: &str, source: irc::error::Error) -> BridgeError {
        IrcTransportError::SendFailed {
            target: target.to_string(),
            source,
        }
        .into()
    }
}

#[async_trait]
impl ChatConnection for IrcConnection {
    async fn join(&self, channel: &str) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.state.pending_joins.insert(channel.to_lowercase(), tx);
        self.sender
            .send_join(channel)
            .map_err(|e| self.send_failed(channel, e))?;

        match timeout(self.join_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(BridgeError::ConnectionClosed {
                key: self.state.key.to_string(),
            }),
            Err(_) => {
                self.state.pending_joins.remove(&channel.to_lowercase());
                Err(BridgeError::JoinFailed {
                    channel: channel.to_string(),
                    reason: format!("no reply within {:?}", self.join_timeout),
                })
            }
        }
    }

    async fn part(&self, channel: &str, reason: &str) -> Result<()> {
        self.sender
            .send(Command::PART(channel.to_string(), Some(reason.to_string())))
            .map_err(|e| self.send_failed(channel, e))
    }

    async fn say(&self, channel: &str, text: &str) -> Result<()> {
        if !self.state.is_open() {
            return Err(BridgeError::SendFailed {
                target: channel.to_string(),
                reason: "connection closed".to_string(),
            });
        }

        // IRC lines cannot carry line breaks
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            self.sender
                .send_privmsg(channel, line)
                .map_err(|e| self.send_failed(channel, e))?;
        }
        Ok(())
    }

    fn messages(&self, channel: &str) -> broadcast::Receiver<ChatMessage> {
        self.state.subscribe(channel)
    }

    async fn closed(&self) {
        let mut link = self.state.link.subscribe();
        let _ = link.wait_for(|up| !*up).await;
    }

    async fn disconnect(&self, reason: &str) {
        if let Err(err) = self.sender.send_quit(reason) {
            debug!("Failed to send QUIT to {}: {}", self.state.key.server, err);
        }

        // the reader drives the outgoing queue, give it a moment to flush
        if let Some(mut reader) = self.take_reader() {
            if timeout(QUIT_TIMEOUT, &mut reader).await.is_err() {
                reader.abort();
            }
        }

        self.state.close();
        info!("Disconnected from {}", self.state.key.uri());
    }
}

impl Drop for IrcConnection {
    fn drop(&mut self) {
        if let Some(reader) = self.take_reader() {
            reader.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> ConnectionState {
        ConnectionState::new(ConnectionKey::new("irc.test", "bridge", true, 6697), "bridge")
    }

    fn message(line: &str) -> Message {
        line.parse().unwrap()
    }

    #[test]
    fn test_registration_completes_on_end_of_motd() {
        let state = state();
        assert_eq!(
            state.dispatch(&message(":irc.test 376 bridge :End of /MOTD command.")),
            Dispatch::Registered
        );
        assert_eq!(
            state.dispatch(&message(":irc.test 422 bridge :MOTD File is missing")),
            Dispatch::Registered
        );
    }

    #[test]
    fn test_welcome_updates_nick() {
        let state = state();
        state.dispatch(&message(":irc.test 001 bridge_ :Welcome to the network"));
        assert_eq!(state.nick(), "bridge_");
    }

    #[tokio::test]
    async fn test_channel_messages_reach_listeners() {
        let state = state();
        let mut listener = state.subscribe("#Test");

        state.dispatch(&message(":bob!b@host PRIVMSG #test :hi there"));
        state.dispatch(&message(":bob!b@host PRIVMSG bridge :private"));
        state.dispatch(&message(":bob!b@host PRIVMSG #test :\u{1}VERSION\u{1}"));
        state.dispatch(&message(":carol!c@host PRIVMSG #TEST :second"));

        let first = listener.recv().await.unwrap();
        assert_eq!((first.sender.as_str(), first.text.as_str()), ("bob", "hi there"));
        let second = listener.recv().await.unwrap();
        assert_eq!((second.sender.as_str(), second.text.as_str()), ("carol", "second"));
        assert!(listener.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_join_confirmation_and_refusal() {
        let state = state();
        let (ok_tx, ok_rx) = oneshot::channel();
        let (err_tx, err_rx) = oneshot::channel();
        state.pending_joins.insert("#ok".to_string(), ok_tx);
        state.pending_joins.insert("#banned".to_string(), err_tx);

        // someone else joining does not confirm our join
        state.dispatch(&message(":bob!b@host JOIN #ok"));
        assert!(state.pending_joins.contains_key("#ok"));

        state.dispatch(&message(":bridge!b@host JOIN #ok"));
        state.dispatch(&message(
            ":irc.test 474 bridge #banned :Cannot join channel (+b)",
        ));

        assert!(ok_rx.await.unwrap().is_ok());
        assert!(matches!(
            err_rx.await.unwrap(),
            Err(BridgeError::JoinFailed { ref channel, .. }) if channel == "#banned"
        ));
    }

    #[test]
    fn test_kick_requests_rejoin() {
        let state = state();
        assert_eq!(
            state.dispatch(&message(":op!o@host KICK #test bridge :bye")),
            Dispatch::Rejoin("#test".to_string())
        );
        assert_eq!(
            state.dispatch(&message(":op!o@host KICK #test bob :bye")),
            Dispatch::None
        );
    }

    #[tokio::test]
    async fn test_close_ends_listeners() {
        let state = state();
        let mut listener = state.subscribe("#test");
        state.close();

        assert!(matches!(
            listener.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
        assert!(matches!(
            state.subscribe("#test").recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
    }
}
