//! The `user.User` service and the shared context its handlers read.

use bytes::Bytes;
use prost::Message;
use rpc_lite::{CallContext, MethodRegistry, RpcError};
use std::sync::Arc;
use tonic::Status;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::proto::{CreateUserRequest, Empty, GetUserRequest, Pong, User};
use crate::resources::{Cache, Database, DbError, UserRow};

pub const SERVICE_NAME: &str = "user.User";
pub const PING: &str = "user.User/Ping";
pub const CREATE_USER: &str = "user.User/CreateUser";
pub const GET_USER: &str = "user.User/GetUser";

/// Resource handles shared by every call.
///
/// Built once at startup and handed to handlers behind an `Arc`. Handlers
/// only read through it; the handles are closed by the lifecycle after the
/// listener has stopped.
pub struct ServiceContext {
    config: Config,
    db: Arc<Database>,
    cache: Arc<Cache>,
}

impl ServiceContext {
    pub fn new(config: Config, db: Arc<Database>, cache: Arc<Cache>) -> Self {
        Self { config, db, cache }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn cache(&self) -> &Cache {
        &self.cache
    }
}

/// Register every `user.User` method.
pub fn register_user_server(registry: &MethodRegistry<ServiceContext>) -> Result<(), RpcError> {
    registry.register_unary(PING, ping)?;
    registry.register_unary(CREATE_USER, create_user)?;
    registry.register_unary(GET_USER, get_user)?;
    debug!(service = SERVICE_NAME, "Registered service");
    Ok(())
}

async fn ping(_svc: Arc<ServiceContext>, ctx: CallContext, _req: Empty) -> Result<Pong, RpcError> {
    info!(call_id = ctx.call_id(), caller = ?ctx.caller(), "rpc ping");
    Ok(Pong {
        message: "pong".to_string(),
    })
}

async fn create_user(
    svc: Arc<ServiceContext>,
    ctx: CallContext,
    req: CreateUserRequest,
) -> Result<User, RpcError> {
    let name = req.name.trim();
    let email = req.email.trim();
    if name.is_empty() {
        return Err(Status::invalid_argument("name is required").into());
    }
    if !email.contains('@') {
        return Err(Status::invalid_argument(format!("invalid email '{email}'")).into());
    }

    let row = ctx.run(async { svc.db.insert_user(name, email).await.map_err(db_error) }).await?;
    let user = to_user(row);
    cache_user(&svc, &user).await;

    info!(user_id = user.id, caller = ?ctx.caller(), "Created user");
    Ok(user)
}

async fn get_user(
    svc: Arc<ServiceContext>,
    ctx: CallContext,
    req: GetUserRequest,
) -> Result<User, RpcError> {
    let key = cache_key(req.id);

    match svc.cache.get(&key).await {
        Ok(Some(raw)) => match User::decode(raw) {
            Ok(user) => {
                debug!(user_id = req.id, "Cache hit");
                return Ok(user);
            }
            Err(e) => warn!(key = %key, error = %e, "Discarding undecodable cache entry"),
        },
        Ok(None) => debug!(user_id = req.id, "Cache miss"),
        Err(e) => warn!(key = %key, error = %e, "Cache unavailable, reading through"),
    }

    let row = ctx
        .run(async { svc.db.find_user(req.id).await.map_err(db_error) })
        .await?
        .ok_or_else(|| Status::not_found(format!("user {} not found", req.id)))?;

    let user = to_user(row);
    cache_user(&svc, &user).await;
    Ok(user)
}

fn cache_key(id: u64) -> String {
    format!("user:{id}")
}

async fn cache_user(svc: &ServiceContext, user: &User) {
    let raw = Bytes::from(user.encode_to_vec());
    if let Err(e) = svc.cache.set(cache_key(user.id), raw).await {
        debug!(user_id = user.id, error = %e, "Skipping cache write");
    }
}

fn to_user(row: UserRow) -> User {
    User {
        id: row.id,
        name: row.name,
        email: row.email,
    }
}

fn db_error(e: DbError) -> RpcError {
    match e {
        DbError::Closed => Status::unavailable(e.to_string()).into(),
        DbError::DuplicateEmail(_) => Status::already_exists(e.to_string()).into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rpc_lite::{Dispatcher, InterceptorChain};
    use std::time::Duration;
    use tonic::Code;

    async fn context() -> Arc<ServiceContext> {
        let db = Database::connect("memory://users").await.unwrap();
        let cache = Cache::with_ttl("127.0.0.1:6379", Duration::from_secs(60));
        Arc::new(ServiceContext::new(Config::default(), Arc::new(db), Arc::new(cache)))
    }

    async fn dispatcher() -> Dispatcher<ServiceContext> {
        let registry = MethodRegistry::new();
        register_user_server(&registry).unwrap();
        Dispatcher::new(&registry, InterceptorChain::new(), context().await)
    }

    async fn call<Req: Message, Resp: Message + Default>(
        dispatcher: &Dispatcher<ServiceContext>,
        method: &str,
        req: &Req,
    ) -> Result<Resp, RpcError> {
        let raw = dispatcher
            .dispatch(method, Bytes::from(req.encode_to_vec()), CallContext::new(1, method))
            .await?;
        Ok(Resp::decode(raw)?)
    }

    #[tokio::test]
    async fn test_registers_all_methods() {
        let dispatcher = dispatcher().await;
        assert_eq!(dispatcher.method_names(), vec![CREATE_USER, GET_USER, PING]);
    }

    #[tokio::test]
    async fn test_ping() {
        let dispatcher = dispatcher().await;
        let pong: Pong = call(&dispatcher, PING, &Empty {}).await.unwrap();
        assert_eq!(pong.message, "pong");
    }

    #[tokio::test]
    async fn test_create_then_get() {
        let dispatcher = dispatcher().await;
        let created: User = call(
            &dispatcher,
            CREATE_USER,
            &CreateUserRequest {
                name: "alice".into(),
                email: "alice@example.com".into(),
            },
        )
        .await
        .unwrap();

        let fetched: User = call(&dispatcher, GET_USER, &GetUserRequest { id: created.id })
            .await
            .unwrap();
        assert_eq!(fetched, created);
        assert_eq!(dispatcher.state().cache().len(), 1);
    }

    #[tokio::test]
    async fn test_get_reads_through_cache_miss() {
        let dispatcher = dispatcher().await;
        let row = dispatcher
            .state()
            .db()
            .insert_user("bob", "bob@example.com")
            .await
            .unwrap();
        assert!(dispatcher.state().cache().is_empty());

        let user: User = call(&dispatcher, GET_USER, &GetUserRequest { id: row.id })
            .await
            .unwrap();
        assert_eq!(user.name, "bob");
        assert_eq!(dispatcher.state().cache().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_user_is_not_found() {
        let dispatcher = dispatcher().await;
        let err = call::<_, User>(&dispatcher, GET_USER, &GetUserRequest { id: 42 })
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::NotFound);
    }

    #[tokio::test]
    async fn test_create_validates_input() {
        let dispatcher = dispatcher().await;
        let err = call::<_, User>(
            &dispatcher,
            CREATE_USER,
            &CreateUserRequest {
                name: "carol".into(),
                email: "not-an-email".into(),
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_duplicate_email_already_exists() {
        let dispatcher = dispatcher().await;
        let req = CreateUserRequest {
            name: "dave".into(),
            email: "dave@example.com".into(),
        };
        call::<_, User>(&dispatcher, CREATE_USER, &req).await.unwrap();
        let err = call::<_, User>(&dispatcher, CREATE_USER, &req).await.unwrap_err();
        assert_eq!(err.code(), Code::AlreadyExists);
    }

    #[tokio::test]
    async fn test_closed_database_is_unavailable() {
        let dispatcher = dispatcher().await;
        dispatcher.state().db().close();
        let err = call::<_, User>(&dispatcher, GET_USER, &GetUserRequest { id: 1 })
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::Unavailable);
    }
}
