use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::{stream, Sink, SinkExt};
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{
    AuthSource, DefaultServerParameterProvider, LoginInfo, Password, StartupHandler,
};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldInfo, QueryResponse,
    Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::data::DataRow;
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::engine::{join_ids, Engine, EngineError, WriteOutcome};
use crate::model::*;
use crate::observability::{self, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, Command, ResultShape, SqlError};
use crate::tenant::TenantManager;

/// Responses plus any warnings to surface as NOTICE messages.
struct Executed {
    responses: Vec<Response>,
    notices: Vec<String>,
}

impl Executed {
    fn plain(response: Response) -> Self {
        Self {
            responses: vec![response],
            notices: Vec::new(),
        }
    }
}

pub struct InspectaHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<InspectaQueryParser>,
}

impl InspectaHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(InspectaQueryParser),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager.get_or_create(&db).map_err(|e| {
            PgWireError::UserError(Box::new(ErrorInfo::new(
                "ERROR".into(),
                "08006".into(),
                format!("organization error: {e}"),
            )))
        })
    }

    /// Parse, execute and record RED metrics for one statement.
    async fn run(&self, engine: &Engine, sql: &str, format: &Format) -> PgWireResult<Executed> {
        let cmd = sql::parse_sql(sql).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(engine, cmd, format).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(
        &self,
        engine: &Engine,
        cmd: Command,
        format: &Format,
    ) -> PgWireResult<Executed> {
        match cmd {
            Command::InsertAppointment { draft, returning } => {
                let outcome = engine.schedule(draft).await.map_err(engine_err)?;
                Ok(write_response("INSERT", outcome, returning, format))
            }
            Command::UpdateAppointment {
                id,
                changes,
                returning,
            } => {
                let outcome = engine.reschedule(id, changes).await.map_err(engine_err)?;
                Ok(write_response("UPDATE", outcome, returning, format))
            }
            Command::SetStatus {
                id,
                status,
                returning,
            } => {
                let outcome = match status {
                    AppointmentStatus::Confirmed => engine.confirm(id).await,
                    AppointmentStatus::Cancelled => engine.cancel(id).await,
                    AppointmentStatus::Tentative => {
                        return Err(sql_err(SqlError::Unsupported(
                            "an appointment cannot be moved back to tentative".into(),
                        )));
                    }
                }
                .map_err(engine_err)?;
                Ok(write_response("UPDATE", outcome, returning, format))
            }
            Command::CancelAppointment { id, returning } => {
                let outcome = engine.cancel(id).await.map_err(engine_err)?;
                Ok(write_response("DELETE", outcome, returning, format))
            }
            Command::SelectAppointments { inspector_id, date } => {
                let entries = engine.schedule_view(inspector_id, date).await;
                let schema = Arc::new(appointment_schema(format));
                let rows: Vec<PgWireResult<_>> = entries
                    .into_iter()
                    .map(|entry| {
                        let a = &entry.appointment;
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&a.id.to_string())?;
                        encoder.encode_field(&a.inspector_id.to_string())?;
                        encoder.encode_field(&a.date.to_string())?;
                        encoder.encode_field(&a.window.start.to_string())?;
                        encoder.encode_field(&a.window.end.to_string())?;
                        encoder.encode_field(&a.status.to_string())?;
                        encoder.encode_field(&a.details.property)?;
                        encoder.encode_field(&a.details.client)?;
                        encoder.encode_field(&a.details.notes)?;
                        encoder.encode_field(&entry.has_conflict)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Executed::plain(Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))))
            }
            Command::SelectConflicts { inspector_id, date } => {
                let pairs = engine.conflicts(inspector_id, date).await;
                let schema = Arc::new(conflict_schema(format));
                let rows: Vec<PgWireResult<_>> = pairs
                    .into_iter()
                    .map(|(first, second)| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&first.inspector_id.to_string())?;
                        encoder.encode_field(&first.date.to_string())?;
                        encoder.encode_field(&first.id.to_string())?;
                        encoder.encode_field(&first.window.start.to_string())?;
                        encoder.encode_field(&first.window.end.to_string())?;
                        encoder.encode_field(&second.id.to_string())?;
                        encoder.encode_field(&second.window.start.to_string())?;
                        encoder.encode_field(&second.window.end.to_string())?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Executed::plain(Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))))
            }
            Command::SelectWorkload {
                inspector_id,
                from,
                to,
            } => {
                let w = engine
                    .workload(inspector_id, from, to)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(workload_schema(format));
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&w.inspector_id.to_string())?;
                encoder.encode_field(&w.from.to_string())?;
                encoder.encode_field(&w.to.to_string())?;
                encoder.encode_field(&(w.appointments as i64))?;
                encoder.encode_field(&w.booked_minutes)?;
                let rows = vec![Ok(encoder.take_row())];
                Ok(Executed::plain(Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))))
            }
        }
    }
}

/// Command tag, or the one-row `RETURNING` result. Soft warnings also go out as notices.
fn write_response(tag: &str, outcome: WriteOutcome, returning: bool, format: &Format) -> Executed {
    let mut notices = Vec::new();
    if let Some(w) = &outcome.warning {
        notices.push(w.to_string());
    }
    if let Some(b) = &outcome.backup {
        notices.push(b.to_string());
    }

    if !returning {
        return Executed {
            responses: vec![Response::Execution(Tag::new(tag).with_rows(1))],
            notices,
        };
    }

    let schema = Arc::new(write_result_schema(format));
    let row = encode_write_result(schema.clone(), &outcome);
    Executed {
        responses: vec![Response::Query(QueryResponse::new(
            schema,
            stream::iter(vec![row]),
        ))],
        notices,
    }
}

fn encode_write_result(schema: Arc<Vec<FieldInfo>>, outcome: &WriteOutcome) -> PgWireResult<DataRow> {
    let conflict_ids = outcome
        .warning
        .as_ref()
        .map(|w| w.ids())
        .unwrap_or_default();
    let mut encoder = DataRowEncoder::new(schema);
    encoder.encode_field(&outcome.appointment.id.to_string())?;
    encoder.encode_field(&outcome.appointment.status.to_string())?;
    encoder.encode_field(&(conflict_ids.len() as i64))?;
    encoder.encode_field(&join_ids(&conflict_ids))?;
    encoder.encode_field(&outcome.backup.as_ref().map(|b| b.to_string()))?;
    Ok(encoder.take_row())
}

// ── Result schemas ───────────────────────────────────────────────

fn fields(columns: &[(&str, Type)], format: &Format) -> Vec<FieldInfo> {
    columns
        .iter()
        .enumerate()
        .map(|(i, (name, ty))| {
            FieldInfo::new((*name).into(), None, None, ty.clone(), format.format_for(i))
        })
        .collect()
}

fn appointment_schema(format: &Format) -> Vec<FieldInfo> {
    fields(
        &[
            ("id", Type::VARCHAR),
            ("inspector_id", Type::VARCHAR),
            ("date", Type::VARCHAR),
            ("start_time", Type::VARCHAR),
            ("end_time", Type::VARCHAR),
            ("status", Type::VARCHAR),
            ("property", Type::VARCHAR),
            ("client", Type::VARCHAR),
            ("notes", Type::VARCHAR),
            ("has_conflict", Type::BOOL),
        ],
        format,
    )
}

fn conflict_schema(format: &Format) -> Vec<FieldInfo> {
    fields(
        &[
            ("inspector_id", Type::VARCHAR),
            ("date", Type::VARCHAR),
            ("first_id", Type::VARCHAR),
            ("first_start", Type::VARCHAR),
            ("first_end", Type::VARCHAR),
            ("second_id", Type::VARCHAR),
            ("second_start", Type::VARCHAR),
            ("second_end", Type::VARCHAR),
        ],
        format,
    )
}

fn workload_schema(format: &Format) -> Vec<FieldInfo> {
    fields(
        &[
            ("inspector_id", Type::VARCHAR),
            ("date_from", Type::VARCHAR),
            ("date_to", Type::VARCHAR),
            ("appointments", Type::INT8),
            ("booked_minutes", Type::INT8),
        ],
        format,
    )
}

fn write_result_schema(format: &Format) -> Vec<FieldInfo> {
    fields(
        &[
            ("id", Type::VARCHAR),
            ("status", Type::VARCHAR),
            ("conflict_count", Type::INT8),
            ("conflicts_with", Type::VARCHAR),
            ("backup_warning", Type::VARCHAR),
        ],
        format,
    )
}

fn schema_for(sql: &str, format: &Format) -> Vec<FieldInfo> {
    match sql::result_shape(sql) {
        Some(ResultShape::Appointments) => appointment_schema(format),
        Some(ResultShape::Conflicts) => conflict_schema(format),
        Some(ResultShape::Workload) => workload_schema(format),
        Some(ResultShape::WriteResult) => write_result_schema(format),
        None => vec![],
    }
}

async fn send_notices<C>(client: &mut C, notices: Vec<String>) -> PgWireResult<()>
where
    C: Sink<PgWireBackendMessage> + Unpin + Send,
    C::Error: Debug,
    PgWireError: From<C::Error>,
{
    for message in notices {
        let info = ErrorInfo::new("WARNING".into(), "01000".into(), message);
        client
            .send(PgWireBackendMessage::NoticeResponse(info.into()))
            .await?;
    }
    Ok(())
}

#[async_trait]
impl SimpleQueryHandler for InspectaHandler {
    async fn do_query<C>(
        &self,
        client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let executed = self.run(&engine, query, &Format::UnifiedText).await?;
        send_notices(client, executed.notices).await?;
        Ok(executed.responses)
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct InspectaQueryParser;

#[async_trait]
impl QueryParser for InspectaQueryParser {
    type Statement = String;

    async fn parse_sql<C>(
        &self,
        _client: &C,
        sql: &str,
        _types: &[Option<Type>],
    ) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(
        &self,
        stmt: &String,
        column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(schema_for(stmt, column_format.unwrap_or(&Format::UnifiedText)))
    }
}

#[async_trait]
impl ExtendedQueryHandler for InspectaHandler {
    type Statement = String;
    type QueryParser = InspectaQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let sql = substitute_params(portal);
        let executed = self
            .run(&engine, &sql, &portal.result_column_format)
            .await?;
        send_notices(client, executed.notices).await?;
        executed
            .responses
            .into_iter()
            .next()
            .ok_or_else(|| sql_err(SqlError::Empty))
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        target: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let param_types = vec![Type::VARCHAR; count_params(&target.statement)];
        Ok(DescribeStatementResponse::new(
            param_types,
            schema_for(&target.statement, &Format::UnifiedText),
        ))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(DescribePortalResponse::new(schema_for(
            &target.statement.statement,
            &target.result_column_format,
        )))
    }
}

/// Highest `$N` placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let bytes = sql.as_bytes();
    let mut max = 0usize;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }
        i += 1;
        let start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        if let Ok(n) = sql[start..i].parse::<usize>() {
            max = max.max(n);
        }
    }
    max
}

/// Substitute `$1`, `$2`, ... with bound parameter values as quoted text.
/// Highest index first, so `$1` never clobbers the prefix of `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    let mut sql = portal.statement.statement.clone();
    for (i, param) in portal.parameters.iter().enumerate().rev() {
        let value = match param {
            Some(bytes) => format!("'{}'", String::from_utf8_lossy(bytes).replace('\'', "''")),
            None => "NULL".to_string(),
        };
        sql = sql.replace(&format!("${}", i + 1), &value);
    }
    sql
}

// ── Auth + factory ───────────────────────────────────────────────

/// One shared cleartext password for every user and organization.
#[derive(Debug)]
pub struct InspectaAuthSource {
    password: String,
}

#[async_trait]
impl AuthSource for InspectaAuthSource {
    async fn get_password(&self, _login: &LoginInfo) -> PgWireResult<Password> {
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}

pub struct InspectaFactory {
    handler: Arc<InspectaHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<InspectaAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl InspectaFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        Self {
            handler: Arc::new(InspectaHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                InspectaAuthSource { password },
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for InspectaFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.auth_handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = Arc::new(InspectaFactory::new(tenant_manager, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::Validation(_) => "22023",
        EngineError::NotFound(_) => "P0002",
        EngineError::AlreadyExists(_) => "23505",
        EngineError::InvalidTransition { .. } | EngineError::Cancelled(_) => "55000",
        EngineError::Conflict(_) => "23P01",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::WalError(_) => "58030",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        sqlstate(&e).into(),
        e.to_string(),
    )))
}

fn sql_err(e: SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}
