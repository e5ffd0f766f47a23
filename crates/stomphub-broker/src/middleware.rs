use std::collections::HashMap;
use std::sync::Arc;

use stomphub_proto::Headers;

use crate::payload::Payload;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Connect,
    Send,
    Subscribe,
    Unsubscribe,
    Disconnect,
}

/// Read-only view of the session a command arrived on.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: String,
    pub connected: bool,
}

/// Mutable command arguments threaded through the interceptor chain.
/// What the chain leaves here is what the terminal handler executes.
#[derive(Debug, Clone)]
pub enum CommandArgs {
    Connect { headers: Headers },
    Send { destination: String, headers: Headers, body: Payload },
    Subscribe { id: String, destination: String },
    Unsubscribe { id: String },
    Disconnect,
}

impl CommandArgs {
    pub fn kind(&self) -> CommandKind {
        match self {
            CommandArgs::Connect { .. } => CommandKind::Connect,
            CommandArgs::Send { .. } => CommandKind::Send,
            CommandArgs::Subscribe { .. } => CommandKind::Subscribe,
            CommandArgs::Unsubscribe { .. } => CommandKind::Unsubscribe,
            CommandArgs::Disconnect => CommandKind::Disconnect,
        }
    }
}

pub type Interceptor =
    Arc<dyn Fn(&SessionInfo, &mut CommandArgs, Next<'_>) + Send + Sync>;

/// Continuation handed to each interceptor. An interceptor that returns
/// without calling `run` aborts the command: the rest of the chain and
/// the terminal handler never execute, and the session stays open.
pub struct Next<'a> {
    chain: &'a [Interceptor],
    reached_end: &'a mut bool,
}

impl Next<'_> {
    pub fn run(
        self,
        session: &SessionInfo,
        args: &mut CommandArgs,
    ) {
        match self.chain.split_first() {
            Some((head, rest)) => {
                head(session, args, Next {
                    chain: rest,
                    reached_end: self.reached_end,
                });
            }
            None => *self.reached_end = true,
        }
    }
}

/// Runs `args` through the chain. Returns false when some layer dropped
/// the command.
pub fn run_chain(
    chain: &[Interceptor],
    session: &SessionInfo,
    args: &mut CommandArgs,
) -> bool {
    let mut reached_end = false;
    Next { chain, reached_end: &mut reached_end }.run(session, args);
    reached_end
}

#[derive(Default)]
pub struct MiddlewareSet {
    chains: HashMap<CommandKind, Vec<Interceptor>>,
}

impl MiddlewareSet {
    pub fn add(
        &mut self,
        kind: CommandKind,
        interceptor: Interceptor,
    ) {
        self.chains.entry(kind).or_default().push(interceptor);
    }

    /// Replaces the whole chain for `kind` with the single interceptor.
    pub fn set(
        &mut self,
        kind: CommandKind,
        interceptor: Interceptor,
    ) {
        self.chains.insert(kind, vec![interceptor]);
    }

    /// Removes the first registration of this exact interceptor.
    pub fn remove(
        &mut self,
        kind: CommandKind,
        interceptor: &Interceptor,
    ) -> bool {
        let Some(chain) = self.chains.get_mut(&kind) else {
            return false;
        };
        let Some(position) =
            chain.iter().position(|entry| Arc::ptr_eq(entry, interceptor))
        else {
            return false;
        };
        chain.remove(position);
        true
    }

    /// Clones the chain so it can run without holding the registry lock.
    pub fn chain_for(&self, kind: CommandKind) -> Vec<Interceptor> {
        self.chains.get(&kind).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use stomphub_proto::Headers;

    use super::{
        CommandArgs, CommandKind, Interceptor, MiddlewareSet, SessionInfo,
        run_chain,
    };
    use crate::payload::Payload;

    fn session() -> SessionInfo {
        SessionInfo { id: "sess-test".to_string(), connected: true }
    }

    fn send_args() -> CommandArgs {
        CommandArgs::Send {
            destination: "/foo".to_string(),
            headers: Headers::new(),
            body: Payload::Text("hi".to_string()),
        }
    }

    #[test]
    fn empty_chain_reaches_terminal() {
        assert!(run_chain(&[], &session(), &mut send_args()));
    }

    #[test]
    fn interceptors_run_in_registration_order() {
        let order = Arc::new(AtomicUsize::new(0));
        let mut set = MiddlewareSet::default();

        let first = order.clone();
        set.add(
            CommandKind::Send,
            Arc::new(move |session, args, next| {
                assert_eq!(first.fetch_add(1, Ordering::SeqCst), 0);
                next.run(session, args);
            }),
        );
        let second = order.clone();
        set.add(
            CommandKind::Send,
            Arc::new(move |session, args, next| {
                assert_eq!(second.fetch_add(1, Ordering::SeqCst), 1);
                next.run(session, args);
            }),
        );

        let chain = set.chain_for(CommandKind::Send);
        assert!(run_chain(&chain, &session(), &mut send_args()));
        assert_eq!(order.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn not_calling_next_aborts_the_command() {
        let mut set = MiddlewareSet::default();
        set.add(CommandKind::Send, Arc::new(|_, _, _| {}));
        set.add(
            CommandKind::Send,
            Arc::new(|_, _, _| panic!("must not reach the second layer")),
        );

        let chain = set.chain_for(CommandKind::Send);
        assert!(!run_chain(&chain, &session(), &mut send_args()));
    }

    #[test]
    fn interceptor_can_rewrite_arguments() {
        let mut set = MiddlewareSet::default();
        set.add(
            CommandKind::Send,
            Arc::new(|session, args, next| {
                if let CommandArgs::Send { destination, .. } = args {
                    *destination = "/rewritten".to_string();
                }
                next.run(session, args);
            }),
        );

        let mut args = send_args();
        let chain = set.chain_for(CommandKind::Send);
        assert!(run_chain(&chain, &session(), &mut args));
        match args {
            CommandArgs::Send { destination, .. } => {
                assert_eq!(destination, "/rewritten");
            }
            _ => panic!("args changed variant"),
        }
    }

    #[test]
    fn set_replaces_and_remove_targets_identity() {
        let mut set = MiddlewareSet::default();
        let noop: Interceptor =
            Arc::new(|session, args, next| next.run(session, args));
        let drop_all: Interceptor = Arc::new(|_, _, _| {});

        set.add(CommandKind::Subscribe, noop.clone());
        set.set(CommandKind::Subscribe, drop_all.clone());
        assert_eq!(set.chain_for(CommandKind::Subscribe).len(), 1);

        assert!(!set.remove(CommandKind::Subscribe, &noop));
        assert!(set.remove(CommandKind::Subscribe, &drop_all));
        assert!(set.chain_for(CommandKind::Subscribe).is_empty());
    }
}
