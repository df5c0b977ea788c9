use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveTime};
use futures::stream;
use futures::{Sink, SinkExt};
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::data::DataRow;
use pgwire::messages::response::NotificationResponse;
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tokio::sync::broadcast::error::TryRecvError;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, warn};
use ulid::Ulid;

use crate::auth::SlotdAuthSource;
use crate::ledger::{Ledger, LedgerError};
use crate::model::*;
use crate::notify::Notification;
use crate::observability::{self, command_label};
use crate::records::{Agency, Client, Property};
use crate::session::Session;
use crate::sql::{self, Command, SqlError};

/// A channel this connection has LISTENed on.
struct Listener {
    channel: String,
    rx: broadcast::Receiver<Notification>,
}

/// One per connection.
pub struct SlotdHandler {
    ledger: Arc<Ledger>,
    admin_user: String,
    query_parser: Arc<SlotdQueryParser>,
    listeners: Mutex<Vec<Listener>>,
}

impl SlotdHandler {
    pub fn new(ledger: Arc<Ledger>, admin_user: String) -> Self {
        Self {
            ledger,
            admin_user,
            query_parser: Arc::new(SlotdQueryParser),
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Take every notification queued on this connection's channels.
    async fn pending_notifications(&self) -> Vec<NotificationResponse> {
        let mut listeners = self.listeners.lock().await;
        let mut out = Vec::new();
        listeners.retain_mut(|l| loop {
            match l.rx.try_recv() {
                Ok(n) => out.push(NotificationResponse::new(
                    backend_pid(),
                    l.channel.clone(),
                    n.payload,
                )),
                Err(TryRecvError::Empty) => break true,
                Err(TryRecvError::Lagged(missed)) => {
                    warn!("listener on {} fell behind, {missed} notifications dropped", l.channel);
                }
                // The inspector was deleted.
                Err(TryRecvError::Closed) => break false,
            }
        });
        out
    }

    /// Flush pending notifications to the client ahead of the query results.
    async fn deliver_notifications<C>(&self, client: &mut C) -> PgWireResult<()>
    where
        C: Sink<PgWireBackendMessage> + Unpin + Send,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        for n in self.pending_notifications().await {
            client
                .send(PgWireBackendMessage::NotificationResponse(n))
                .await?;
        }
        Ok(())
    }

    /// The login name picks the role: the admin user, or an inspector id.
    fn resolve_session<C: ClientInfo>(&self, client: &C) -> PgWireResult<Session> {
        let user = client
            .metadata()
            .get("user")
            .map(String::as_str)
            .unwrap_or_default();
        Session::for_login(user, &self.admin_user).ok_or_else(|| {
            metrics::counter!(observability::AUTH_FAILURES_TOTAL).increment(1);
            warn!("rejected login {user:?}: neither admin nor an inspector id");
            user_error(
                "28000",
                format!("login {user:?} is neither the admin user nor an inspector id"),
            )
        })
    }

    /// Execute with query metrics recorded.
    async fn run(&self, session: &Session, cmd: Command) -> PgWireResult<Vec<Response>> {
        let label = command_label(&cmd);
        let start = Instant::now();
        let result = self.execute_command(session, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(start.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, session: &Session, cmd: Command) -> PgWireResult<Vec<Response>> {
        let ledger = &self.ledger;
        match cmd {
            // ── Inspectors ───────────────────────────────────
            Command::InsertInspector {
                id,
                name,
                slot_minutes,
            } => {
                ledger
                    .create_inspector(session, id, &name, slot_minutes)
                    .await
                    .map_err(ledger_err)?;
                Ok(vec![tag("INSERT", 1)])
            }
            Command::UpdateInspector {
                id,
                name,
                slot_minutes,
            } => {
                session.require_admin().map_err(ledger_err)?;
                let current = match ledger.get_inspector(&id) {
                    Some(rs) => rs.read().await.info(),
                    None => return Err(ledger_err(LedgerError::NotFound(id))),
                };
                ledger
                    .update_inspector(
                        session,
                        id,
                        name.as_deref().unwrap_or(&current.name),
                        slot_minutes.unwrap_or(current.slot_minutes),
                    )
                    .await
                    .map_err(ledger_err)?;
                Ok(vec![tag("UPDATE", 1)])
            }
            Command::DeleteInspector { id } => {
                ledger.delete_inspector(session, id).await.map_err(ledger_err)?;
                Ok(vec![tag("DELETE", 1)])
            }
            Command::InsertTemplate {
                id,
                inspector_id,
                weekday,
                start,
                end,
            } => {
                let range = TimeRange::new(start, end).map_err(ledger_err)?;
                ledger
                    .add_template_range(session, id, inspector_id, weekday, range)
                    .await
                    .map_err(ledger_err)?;
                Ok(vec![tag("INSERT", 1)])
            }
            Command::DeleteTemplate { id } => {
                ledger.remove_template_range(session, id).await.map_err(ledger_err)?;
                Ok(vec![tag("DELETE", 1)])
            }
            Command::SetOverride {
                inspector_id,
                date,
                ranges,
            } => {
                let count = ranges.len().max(1);
                let ranges = ranges
                    .into_iter()
                    .map(|(start, end)| TimeRange::new(start, end))
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(ledger_err)?;
                ledger
                    .set_override(session, inspector_id, date, ranges)
                    .await
                    .map_err(ledger_err)?;
                Ok(vec![tag("INSERT", count)])
            }
            Command::ClearOverride { inspector_id, date } => {
                let cleared = ledger
                    .clear_override(session, inspector_id, date)
                    .await
                    .map_err(ledger_err)?;
                Ok(vec![tag("DELETE", usize::from(cleared))])
            }

            // ── Records ──────────────────────────────────────
            Command::InsertClient {
                id,
                name,
                email,
                phone,
            } => {
                let client = Client::new(id, &name, &email, phone.as_deref())
                    .map_err(|e| ledger_err(e.into()))?;
                ledger.register_client(session, client).await.map_err(ledger_err)?;
                Ok(vec![tag("INSERT", 1)])
            }
            Command::DeleteClient { id } => {
                ledger.remove_client(session, id).await.map_err(ledger_err)?;
                Ok(vec![tag("DELETE", 1)])
            }
            Command::InsertAgency { id, name, rates } => {
                let agency = Agency::new(id, &name, rates).map_err(|e| ledger_err(e.into()))?;
                ledger.register_agency(session, agency).await.map_err(ledger_err)?;
                Ok(vec![tag("INSERT", 1)])
            }
            Command::DeleteAgency { id } => {
                ledger.remove_agency(session, id).await.map_err(ledger_err)?;
                Ok(vec![tag("DELETE", 1)])
            }
            Command::InsertProperty {
                id,
                code,
                client_id,
                agency_id,
                address,
                size_m2,
                furnishing,
            } => {
                let property =
                    Property::new(id, &code, client_id, agency_id, &address, size_m2, furnishing)
                        .map_err(|e| ledger_err(e.into()))?;
                ledger.register_property(session, property).await.map_err(ledger_err)?;
                Ok(vec![tag("INSERT", 1)])
            }
            Command::DeleteProperty { id } => {
                ledger.remove_property(session, id).await.map_err(ledger_err)?;
                Ok(vec![tag("DELETE", 1)])
            }

            // ── Slot transitions ─────────────────────────────
            Command::InsertAppointment {
                id,
                slot_id,
                request,
            } => {
                ledger.book(session, id, slot_id, request).await.map_err(ledger_err)?;
                Ok(vec![tag("INSERT", 1)])
            }
            Command::DeleteAppointment { id } => {
                ledger.cancel(session, id).await.map_err(ledger_err)?;
                Ok(vec![tag("DELETE", 1)])
            }
            Command::MarkUnproductive {
                slot_id,
                reason,
                charge: None,
            } => {
                ledger
                    .mark_unproductive(session, slot_id, &reason)
                    .await
                    .map_err(ledger_err)?;
                Ok(vec![tag("INSERT", 1)])
            }
            Command::MarkUnproductive {
                slot_id,
                reason,
                charge: Some(request),
            } => {
                ledger
                    .mark_unproductive_billed(session, slot_id, &reason, request)
                    .await
                    .map_err(ledger_err)?;
                Ok(vec![tag("INSERT", 1)])
            }
            Command::PayCharge { id } => {
                let paid = ledger.pay_charge(session, id).await.map_err(ledger_err)?;
                Ok(vec![tag("UPDATE", usize::from(paid))])
            }
            Command::ResetSlot { slot_id } => {
                ledger.reset_slot(session, slot_id).await.map_err(ledger_err)?;
                Ok(vec![tag("DELETE", 1)])
            }

            // ── Queries ──────────────────────────────────────
            Command::SelectSlots {
                inspector_id,
                from,
                to,
            } => {
                let slots = ledger
                    .list_slots(session, inspector_id, from, to)
                    .await
                    .map_err(ledger_err)?;
                rows("slots", slots.iter(), |enc, slot| {
                    let (appointment_id, reason) = match &slot.state {
                        SlotState::Free => (None, None),
                        SlotState::Booked { appointment_id } => {
                            (Some(appointment_id.to_string()), None)
                        }
                        SlotState::Unproductive { reason } => (None, Some(reason.clone())),
                    };
                    enc.encode_field(&slot.id.to_string())?;
                    enc.encode_field(&slot.inspector_id.to_string())?;
                    enc.encode_field(&slot.date.to_string())?;
                    enc.encode_field(&hhmm(slot.start_time()))?;
                    enc.encode_field(&hhmm(slot.end_time()))?;
                    enc.encode_field(&slot.state.label())?;
                    enc.encode_field(&appointment_id)?;
                    enc.encode_field(&reason)
                })
            }
            Command::SelectAppointments {
                inspector_id,
                agency_id,
                from,
                to,
            } => {
                let appointments = ledger
                    .list_appointments(session, inspector_id, agency_id, from, to)
                    .await
                    .map_err(ledger_err)?;
                rows("appointments", appointments.iter(), |enc, a| {
                    enc.encode_field(&a.id.to_string())?;
                    enc.encode_field(&a.slot_id.to_string())?;
                    enc.encode_field(&a.inspector_id.to_string())?;
                    enc.encode_field(&a.date().map(|d| d.to_string()))?;
                    enc.encode_field(&hhmm(time_at(a.span.start)))?;
                    enc.encode_field(&hhmm(time_at(a.span.end)))?;
                    enc.encode_field(&a.client_id.to_string())?;
                    enc.encode_field(&a.agency_id.to_string())?;
                    enc.encode_field(&a.property_id.to_string())?;
                    enc.encode_field(&a.kind.as_str())?;
                    enc.encode_field(&a.fee_cents)?;
                    enc.encode_field(&a.payout_cents)
                })
            }
            Command::SelectInspectors => {
                let inspectors = ledger.list_inspectors().await;
                rows("inspectors", inspectors.iter(), |enc, i| {
                    enc.encode_field(&i.id.to_string())?;
                    enc.encode_field(&i.name)?;
                    enc.encode_field(&i64::from(i.slot_minutes))
                })
            }
            Command::SelectTemplates { inspector_id } => {
                let template = ledger
                    .get_template(session, inspector_id)
                    .await
                    .map_err(ledger_err)?;
                rows("templates", template.iter(), |enc, t| {
                    enc.encode_field(&t.id.to_string())?;
                    enc.encode_field(&inspector_id.to_string())?;
                    enc.encode_field(&t.weekday.to_string())?;
                    enc.encode_field(&hhmm(t.range.start))?;
                    enc.encode_field(&hhmm(t.range.end))
                })
            }
            Command::SelectOverrides {
                inspector_id,
                from,
                to,
            } => {
                let overrides = ledger
                    .get_overrides(session, inspector_id, from, to)
                    .await
                    .map_err(ledger_err)?;
                // A closed day is one row with NULL times.
                let flat: Vec<(NaiveDate, Option<TimeRange>)> = overrides
                    .into_iter()
                    .flat_map(|(date, ranges)| {
                        if ranges.is_empty() {
                            vec![(date, None)]
                        } else {
                            ranges.into_iter().map(|r| (date, Some(r))).collect()
                        }
                    })
                    .collect();
                rows("overrides", flat.iter(), |enc, (date, range)| {
                    enc.encode_field(&inspector_id.to_string())?;
                    enc.encode_field(&date.to_string())?;
                    enc.encode_field(&range.map(|r| hhmm(r.start)))?;
                    enc.encode_field(&range.map(|r| hhmm(r.end)))
                })
            }
            Command::SelectCharges { filter } => {
                let charges = ledger.list_charges(session, &filter).map_err(ledger_err)?;
                rows("charges", charges.iter(), |enc, c| {
                    enc.encode_field(&c.id.to_string())?;
                    enc.encode_field(&c.slot_id.to_string())?;
                    enc.encode_field(&c.inspector_id.to_string())?;
                    enc.encode_field(&c.date.to_string())?;
                    enc.encode_field(&c.client_id.to_string())?;
                    enc.encode_field(&c.agency_id.map(|id| id.to_string()))?;
                    enc.encode_field(&c.property_id.map(|id| id.to_string()))?;
                    enc.encode_field(&c.reason)?;
                    enc.encode_field(&c.amount_cents)?;
                    enc.encode_field(&c.payout_cents)?;
                    enc.encode_field(&c.is_paid())
                })
            }
            Command::SelectClients => {
                let records = ledger.records();
                let clients = records.clients();
                rows("clients", clients.iter(), |enc, c| {
                    enc.encode_field(&c.id().to_string())?;
                    enc.encode_field(&c.name())?;
                    enc.encode_field(&c.email())?;
                    enc.encode_field(&c.phone())?;
                    enc.encode_field(&records.client_balance(&c.id()))
                })
            }
            Command::SelectAgencies => {
                let agencies = ledger.records().agencies();
                rows("agencies", agencies.iter(), |enc, a| {
                    let rates = a.rates();
                    enc.encode_field(&a.id().to_string())?;
                    enc.encode_field(&a.name())?;
                    enc.encode_field(&rates.unfurnished)?;
                    enc.encode_field(&rates.semi_furnished)?;
                    enc.encode_field(&rates.furnished)
                })
            }
            Command::SelectProperties => {
                let properties = ledger.records().properties();
                rows("properties", properties.iter(), |enc, p| {
                    enc.encode_field(&p.id().to_string())?;
                    enc.encode_field(&p.code())?;
                    enc.encode_field(&p.client_id().to_string())?;
                    enc.encode_field(&p.agency_id().to_string())?;
                    enc.encode_field(&p.address())?;
                    enc.encode_field(&p.size_m2())?;
                    enc.encode_field(&p.furnishing().as_str())
                })
            }

            // ── Notifications ────────────────────────────────
            Command::Listen { channel } => {
                let inspector_id = channel_inspector(&channel)?;
                session.require_access(inspector_id).map_err(ledger_err)?;
                if ledger.get_inspector(&inspector_id).is_none() {
                    return Err(ledger_err(LedgerError::NotFound(inspector_id)));
                }
                let mut listeners = self.listeners.lock().await;
                if !listeners.iter().any(|l| l.channel == channel) {
                    debug!("{} listening on {channel}", session.user());
                    listeners.push(Listener {
                        rx: ledger.notify.subscribe(inspector_id),
                        channel,
                    });
                }
                Ok(vec![Response::Execution(Tag::new("LISTEN"))])
            }
            Command::Unlisten { channel } => {
                let mut listeners = self.listeners.lock().await;
                match channel {
                    Some(channel) => listeners.retain(|l| l.channel != channel),
                    None => listeners.clear(),
                }
                Ok(vec![Response::Execution(Tag::new("UNLISTEN"))])
            }
        }
    }
}

/// `inspector_<id>` → the inspector id.
fn channel_inspector(channel: &str) -> PgWireResult<Ulid> {
    channel
        .strip_prefix("inspector_")
        .and_then(|id| Ulid::from_string(id).ok())
        .ok_or_else(|| {
            user_error(
                "42602",
                format!("invalid channel {channel:?}: expected inspector_<id>"),
            )
        })
}

fn backend_pid() -> i32 {
    std::process::id() as i32
}

fn tag(command: &str, rows: usize) -> Response {
    Response::Execution(Tag::new(command).with_rows(rows))
}

fn hhmm(t: NaiveTime) -> String {
    t.format("%H:%M").to_string()
}

/// Encode `items` into a query response with the schema of `table`.
fn rows<'a, T: 'a>(
    table: &str,
    items: impl Iterator<Item = &'a T>,
    mut encode: impl FnMut(&mut DataRowEncoder, &T) -> PgWireResult<()>,
) -> PgWireResult<Vec<Response>> {
    let schema = Arc::new(result_schema(table));
    let data: Vec<PgWireResult<DataRow>> = items
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(vec![Response::Query(QueryResponse::new(
        schema,
        stream::iter(data),
    ))])
}

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

/// Result columns of `SELECT * FROM <table>`. Empty for unknown tables.
fn result_schema(table: &str) -> Vec<FieldInfo> {
    use Type as T;
    let cols: Vec<(&str, Type)> = match table {
        "slots" => vec![
            ("slot_id", T::VARCHAR),
            ("inspector_id", T::VARCHAR),
            ("day", T::VARCHAR),
            ("start", T::VARCHAR),
            ("end", T::VARCHAR),
            ("state", T::VARCHAR),
            ("appointment_id", T::VARCHAR),
            ("reason", T::VARCHAR),
        ],
        "appointments" => vec![
            ("id", T::VARCHAR),
            ("slot_id", T::VARCHAR),
            ("inspector_id", T::VARCHAR),
            ("day", T::VARCHAR),
            ("start", T::VARCHAR),
            ("end", T::VARCHAR),
            ("client_id", T::VARCHAR),
            ("agency_id", T::VARCHAR),
            ("property_id", T::VARCHAR),
            ("kind", T::VARCHAR),
            ("fee_cents", T::INT8),
            ("payout_cents", T::INT8),
        ],
        "charges" => vec![
            ("id", T::VARCHAR),
            ("slot_id", T::VARCHAR),
            ("inspector_id", T::VARCHAR),
            ("day", T::VARCHAR),
            ("client_id", T::VARCHAR),
            ("agency_id", T::VARCHAR),
            ("property_id", T::VARCHAR),
            ("reason", T::VARCHAR),
            ("amount_cents", T::INT8),
            ("payout_cents", T::INT8),
            ("paid", T::BOOL),
        ],
        "inspectors" => vec![
            ("id", T::VARCHAR),
            ("name", T::VARCHAR),
            ("slot_minutes", T::INT8),
        ],
        "templates" => vec![
            ("id", T::VARCHAR),
            ("inspector_id", T::VARCHAR),
            ("weekday", T::VARCHAR),
            ("start", T::VARCHAR),
            ("end", T::VARCHAR),
        ],
        "overrides" => vec![
            ("inspector_id", T::VARCHAR),
            ("day", T::VARCHAR),
            ("start", T::VARCHAR),
            ("end", T::VARCHAR),
        ],
        "clients" => vec![
            ("id", T::VARCHAR),
            ("name", T::VARCHAR),
            ("email", T::VARCHAR),
            ("phone", T::VARCHAR),
            ("balance_cents", T::INT8),
        ],
        "agencies" => vec![
            ("id", T::VARCHAR),
            ("name", T::VARCHAR),
            ("rate_unfurnished", T::INT8),
            ("rate_semi_furnished", T::INT8),
            ("rate_furnished", T::INT8),
        ],
        "properties" => vec![
            ("id", T::VARCHAR),
            ("code", T::VARCHAR),
            ("client_id", T::VARCHAR),
            ("agency_id", T::VARCHAR),
            ("address", T::VARCHAR),
            ("size_m2", T::FLOAT8),
            ("furnishing", T::VARCHAR),
        ],
        _ => Vec::new(),
    };
    cols.into_iter().map(|(name, ty)| field(name, ty)).collect()
}

/// Table named after FROM in a SELECT, lowercased.
fn select_table(sql: &str) -> Option<String> {
    let lower = sql.to_lowercase();
    let mut words = lower.split_whitespace();
    if words.next()? != "select" {
        return None;
    }
    words.by_ref().find(|w| *w == "from")?;
    words
        .next()
        .map(|t| t.trim_matches(|c| c == ';' || c == '"').to_string())
}

fn statement_schema(sql: &str) -> Vec<FieldInfo> {
    select_table(sql).map_or_else(Vec::new, |t| result_schema(&t))
}

#[async_trait]
impl SimpleQueryHandler for SlotdHandler {
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
        let session = self.resolve_session(client)?;
        let cmds = sql::parse_batch(query).map_err(sql_err)?;
        let mut responses = Vec::with_capacity(cmds.len());
        for cmd in cmds {
            responses.extend(self.run(&session, cmd).await?);
        }
        self.deliver_notifications(client).await?;
        Ok(responses)
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct SlotdQueryParser;

#[async_trait]
impl QueryParser for SlotdQueryParser {
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
        _column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(statement_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for SlotdHandler {
    type Statement = String;
    type QueryParser = SlotdQueryParser;

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
        let session = self.resolve_session(client)?;
        let sql = substitute_params(portal);
        let cmd = sql::parse_sql(&sql).map_err(sql_err)?;
        let response = self
            .run(&session, cmd)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| user_error("XX000", "command produced no response".into()))?;
        self.deliver_notifications(client).await?;
        Ok(response)
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
            statement_schema(&target.statement),
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
        Ok(DescribePortalResponse::new(statement_schema(
            &target.statement.statement,
        )))
    }
}

/// Count the highest $N parameter placeholder in the SQL string.
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

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
/// Replaces from the highest index down so `$1` never clobbers `$10`.
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

// ── Factory ──────────────────────────────────────────────────────

pub struct SlotdFactory {
    handler: Arc<SlotdHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<SlotdAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl SlotdFactory {
    pub fn new(ledger: Arc<Ledger>, password: String, admin_user: String) -> Self {
        let auth_source = SlotdAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(SlotdHandler::new(ledger, admin_user)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for SlotdFactory {
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
    ledger: Arc<Ledger>,
    password: String,
    admin_user: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = Arc::new(SlotdFactory::new(ledger, password, admin_user));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        message,
    )))
}

/// SQLSTATE for a ledger error.
fn sqlstate(e: &LedgerError) -> &'static str {
    match e {
        LedgerError::InvalidRange(_) | LedgerError::Validation(_) => "22023",
        LedgerError::SlotUnavailable { .. } => "23P01",
        LedgerError::NotFound(_) => "P0002",
        LedgerError::AlreadyExists(_) => "23505",
        LedgerError::InUse(_) => "23503",
        LedgerError::Forbidden(_) => "42501",
        LedgerError::LimitExceeded(_) => "54000",
        LedgerError::Wal(_) => "58030",
    }
}

fn ledger_err(e: LedgerError) -> PgWireError {
    user_error(sqlstate(&e), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    #[test]
    fn sqlstates() {
        let slot = Ulid::new();
        assert_eq!(
            sqlstate(&LedgerError::SlotUnavailable {
                slot,
                state: "booked"
            }),
            "23P01"
        );
        assert_eq!(sqlstate(&LedgerError::NotFound(slot)), "P0002");
        assert_eq!(sqlstate(&LedgerError::InvalidRange("x".into())), "22023");
        assert_eq!(sqlstate(&LedgerError::Forbidden("x".into())), "42501");
    }

    #[test]
    fn select_table_from_statement() {
        assert_eq!(
            select_table("SELECT * FROM slots WHERE inspector_id = $1").as_deref(),
            Some("slots")
        );
        assert_eq!(select_table("select id from Inspectors;").as_deref(), Some("inspectors"));
        assert_eq!(select_table("INSERT INTO slots VALUES (1)"), None);
        assert_eq!(statement_schema("SELECT * FROM appointments").len(), 12);
        assert_eq!(statement_schema("SELECT * FROM charges").len(), 11);
        assert!(statement_schema("SELECT * FROM nowhere").is_empty());
    }

    #[test]
    fn channel_names() {
        let id = Ulid::new();
        assert_eq!(channel_inspector(&format!("inspector_{id}")).unwrap(), id);
        assert!(channel_inspector(&format!("resource_{id}")).is_err());
        assert!(channel_inspector("inspector_nope").is_err());
    }

    #[test]
    fn count_params_takes_highest() {
        assert_eq!(count_params("SELECT * FROM slots WHERE a = $1 AND b = $12"), 12);
        assert_eq!(count_params("SELECT '$' FROM inspectors"), 0);
    }
}
