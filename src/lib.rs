pub mod app;
pub mod config;
pub mod error;
pub mod features;

pub use app::SignatureApp;
pub use config::Config;
pub use error::{Error, Result};
pub use features::codec::{decode_from_storage, encode_capture, encode_for_storage, SignatureImage};
pub use features::pdf::{annotate, Placement};
pub use features::records::{DocumentType, PdfSignatureRecord, SignatureRecord, SyncState};

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use features::pdf::{page_size, scaled_size};
use features::records::StoredRecord;
use features::storage::{output_dir_for, parse_file_uri_path};
use features::sync::SyncReport;
use jni::objects::{JClass, JString};
use jni::sys::jstring;
use jni::JNIEnv;
use serde::Deserialize;
use serde_json::{json, Value};
use std::{collections::HashMap, fs, path::PathBuf, ptr, sync::Mutex};
use uuid::Uuid;

#[cfg(unix)]
use std::{
    fs::File,
    io::Read,
    os::unix::io::{FromRawFd, RawFd},
};

static BRIDGE: Mutex<Option<Bridge>> = Mutex::new(None);

/// What the host keeps alive between `init` and `shutdown`.
struct Bridge {
    app: SignatureApp,
    runtime: tokio::runtime::Runtime,
}

impl Bridge {
    fn start(config: &Config) -> Result<Self, String> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("fieldsign-sync")
            .enable_all()
            .build()
            .map_err(|e| format!("runtime_start_failed:{e}"))?;
        let app = SignatureApp::from_config(config).map_err(|e| crate_error(&e))?;
        {
            let _enter = runtime.enter();
            app.start();
        }
        Ok(Self { app, runtime })
    }
}

#[derive(Deserialize, Default)]
struct Command {
    action: String,
    path: Option<String>,
    fd: Option<i32>,
    bindings: Option<HashMap<String, String>>,
}

#[derive(Debug)]
enum Action {
    Init {
        bindings: HashMap<String, String>,
    },
    Shutdown,
    SaveSignature {
        document_id: String,
        document_type: DocumentType,
        signature: String,
    },
    SavePdfSignature {
        document_id: String,
        uri: Option<String>,
        pdf_base64: Option<String>,
        signature: String,
        x: f64,
        y: f64,
        page_index: i64,
        top_left: bool,
    },
    ListSignatures,
    ListPdfSignatures,
    SyncStatus,
    Connectivity {
        online: bool,
    },
    SyncNow,
    ExportPdfSignature {
        id: Uuid,
        uri: Option<String>,
    },
}

/// Closes a host-provided descriptor unless ownership was taken.
struct FdHandle(Option<i32>);

impl FdHandle {
    fn new(fd: Option<i32>) -> Self {
        Self(fd)
    }

    fn take(&mut self) -> Option<i32> {
        self.0.take()
    }
}

impl Drop for FdHandle {
    fn drop(&mut self) {
        if let Some(fd) = self.0.take() {
            close_fd(fd);
        }
    }
}

#[cfg(unix)]
fn close_fd(fd: i32) {
    if fd >= 0 {
        drop(unsafe { File::from_raw_fd(fd as RawFd) });
    }
}

#[cfg(not(unix))]
fn close_fd(_fd: i32) {}

fn required(bindings: &HashMap<String, String>, key: &str) -> Result<String, String> {
    bindings
        .get(key)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| format!("missing_{key}"))
}

fn parse_f64_binding(bindings: &HashMap<String, String>, key: &str) -> Option<f64> {
    bindings
        .get(key)
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite())
}

fn parse_i64_binding(bindings: &HashMap<String, String>, key: &str) -> Option<i64> {
    bindings.get(key).and_then(|v| v.trim().parse::<i64>().ok())
}

fn parse_bool_binding(bindings: &HashMap<String, String>, key: &str) -> Option<bool> {
    bindings
        .get(key)
        .and_then(|v| match v.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Some(true),
            "0" | "false" | "no" | "off" => Some(false),
            _ => None,
        })
}

fn parse_action(command: Command) -> Result<Action, String> {
    let Command {
        action,
        path,
        bindings,
        ..
    } = command;
    let bindings = bindings.unwrap_or_default();

    match action.as_str() {
        "init" => Ok(Action::Init { bindings }),
        "shutdown" => Ok(Action::Shutdown),
        "save_signature" => Ok(Action::SaveSignature {
            document_id: required(&bindings, "document_id")?,
            document_type: required(&bindings, "document_type")?.parse()?,
            signature: required(&bindings, "signature_base64")?,
        }),
        "save_pdf_signature" => Ok(Action::SavePdfSignature {
            document_id: required(&bindings, "document_id")?,
            uri: path,
            pdf_base64: bindings.get("pdf_base64").cloned(),
            signature: required(&bindings, "signature_base64")?,
            x: parse_f64_binding(&bindings, "x").ok_or("invalid_x")?,
            y: parse_f64_binding(&bindings, "y").ok_or("invalid_y")?,
            page_index: parse_i64_binding(&bindings, "page_index").ok_or("invalid_page_index")?,
            top_left: bindings.get("origin").map(|o| o == "top_left").unwrap_or(false),
        }),
        "list_signatures" => Ok(Action::ListSignatures),
        "list_pdf_signatures" => Ok(Action::ListPdfSignatures),
        "sync_status" => Ok(Action::SyncStatus),
        "connectivity" => Ok(Action::Connectivity {
            online: parse_bool_binding(&bindings, "online").ok_or("invalid_online")?,
        }),
        "sync_now" => Ok(Action::SyncNow),
        "export_pdf_signature" => Ok(Action::ExportPdfSignature {
            id: required(&bindings, "id")?
                .parse()
                .map_err(|_| "invalid_id".to_string())?,
            uri: path,
        }),
        other => Err(format!("unknown_action:{other}")),
    }
}

#[no_mangle]
pub extern "system" fn Java_app_fieldsign_SignatureBridge_dispatch(
    mut env: JNIEnv,
    _class: JClass,
    input: JString,
) -> jstring {
    let response = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        let input_str: String = env
            .get_string(&input)
            .map(|s| s.into())
            .unwrap_or_else(|_| "{}".to_string());
        dispatch_json(&input_str)
    }));

    let output_string = match response {
        Ok(output) => output,
        Err(_) => error_response("panic").to_string(),
    };
    match env.new_string(output_string) {
        Ok(java_str) => java_str.into_raw(),
        Err(_) => {
            let fallback = error_response("jni_new_string_failed").to_string();
            env.new_string(fallback)
                .map(|s| s.into_raw())
                .unwrap_or(ptr::null_mut())
        }
    }
}

/// Runs one JSON command and returns the JSON response.
pub fn dispatch_json(input: &str) -> String {
    let result = serde_json::from_str::<Command>(input)
        .map_err(|e| format!("invalid_json:{e}"))
        .and_then(handle_command);
    match result {
        Ok(value) => value.to_string(),
        Err(err) => error_response(&err).to_string(),
    }
}

fn error_response(message: &str) -> Value {
    let code = message.split(':').next().unwrap_or(message);
    json!({
        "type": "Error",
        "code": code,
        "message": message,
    })
}

fn crate_error(err: &Error) -> String {
    format!("{}:{}", err.code(), err)
}

fn ok_response(action: &str, payload: Value) -> Value {
    json!({
        "type": "Ok",
        "action": action,
        "data": payload,
    })
}

fn handle_command(mut command: Command) -> Result<Value, String> {
    // Closed on every exit unless a document read takes it over.
    let mut fd = FdHandle::new(command.fd.take());
    let mut slot = match BRIDGE.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    match parse_action(command)? {
        Action::Init { bindings } => {
            let mut config = Config::from_env().map_err(|e| format!("invalid_config:{e}"))?;
            config
                .apply_bindings(&bindings)
                .map_err(|e| format!("invalid_config:{e}"))?;
            let _ = env_logger::Builder::from_env(
                env_logger::Env::default().default_filter_or("info"),
            )
            .try_init();
            // Tear the previous instance down before opening the store again.
            slot.take();
            let bridge = Bridge::start(&config)?;
            let online = bridge.app.connectivity().is_online();
            *slot = Some(bridge);
            Ok(ok_response(
                "init",
                json!({
                    "storage_dir": config.resolved_storage_dir().display().to_string(),
                    "online": online,
                }),
            ))
        }
        Action::Shutdown => {
            let was_running = slot.take().is_some();
            Ok(ok_response("shutdown", json!({ "was_running": was_running })))
        }
        action => {
            let bridge = slot.as_ref().ok_or_else(|| "not_initialized".to_string())?;
            run_action(bridge, action, &mut fd)
        }
    }
}

fn run_action(bridge: &Bridge, action: Action, fd: &mut FdHandle) -> Result<Value, String> {
    let app = &bridge.app;
    let runtime = &bridge.runtime;

    match action {
        Action::Init { .. } | Action::Shutdown => Err("invalid_state".to_string()),
        Action::SaveSignature {
            document_id,
            document_type,
            signature,
        } => {
            let image = SignatureImage::from_base64(&signature)
                .map_err(|e| crate_error(&e.into()))?;
            let record = runtime
                .block_on(app.save_signature(&document_id, document_type, image))
                .map_err(|e| crate_error(&e))?;
            Ok(ok_response("save_signature", signature_summary(app, &record)))
        }
        Action::SavePdfSignature {
            document_id,
            uri,
            pdf_base64,
            signature,
            x,
            y,
            page_index,
            top_left,
        } => {
            let original = read_document(fd, uri.as_deref(), pdf_base64.as_deref())?;
            let image = SignatureImage::from_base64(&signature)
                .map_err(|e| crate_error(&e.into()))?;
            let placement = if top_left {
                let page = page_size(&original, page_index).map_err(|e| crate_error(&e.into()))?;
                let (px_w, px_h) = image
                    .dimensions()
                    .map_err(|e| format!("signature_image_invalid:{e}"))?;
                let (_, drawn_height) = scaled_size(px_w.max(1), px_h);
                Placement::from_top_left(x, y, page.height, drawn_height, page_index)
            } else {
                Placement::new(x, y, page_index)
            };
            let record = runtime
                .block_on(app.save_pdf_signature(&document_id, original, image, placement))
                .map_err(|e| crate_error(&e))?;
            // The record is stored and queued for sync; an export failure must not hide it.
            let mut summary = pdf_signature_summary(app, &record);
            match write_signed_pdf(&record, uri.as_deref()) {
                Ok(output_path) => {
                    summary["output_path"] = json!(output_path.display().to_string());
                }
                Err(err) => {
                    log::warn!("signed document {} stored but not exported: {}", record.id, err);
                    summary["output_path"] = Value::Null;
                    summary["export_error"] = json!(err);
                }
            }
            Ok(ok_response("save_pdf_signature", summary))
        }
        Action::ListSignatures => {
            let records = runtime
                .block_on(app.signatures().list())
                .map_err(|e| crate_error(&e))?;
            let items: Vec<Value> = records.iter().map(|r| signature_summary(app, r)).collect();
            Ok(ok_response(
                "list_signatures",
                json!({
                    "items": items,
                    "decode_error": app.signatures().last_decode_error(),
                }),
            ))
        }
        Action::ListPdfSignatures => {
            let records = runtime
                .block_on(app.pdf_signatures().list())
                .map_err(|e| crate_error(&e))?;
            let items: Vec<Value> = records
                .iter()
                .map(|r| pdf_signature_summary(app, r))
                .collect();
            Ok(ok_response(
                "list_pdf_signatures",
                json!({
                    "items": items,
                    "decode_error": app.pdf_signatures().last_decode_error(),
                }),
            ))
        }
        Action::SyncStatus => {
            let (plain_total, plain_unsynced, pdf_total, pdf_unsynced) = runtime
                .block_on(async {
                    Ok::<_, Error>((
                        app.signatures().len().await?,
                        app.signatures().unsynced_count().await?,
                        app.pdf_signatures().len().await?,
                        app.pdf_signatures().unsynced_count().await?,
                    ))
                })
                .map_err(|e| crate_error(&e))?;
            Ok(ok_response(
                "sync_status",
                json!({
                    "online": app.connectivity().is_online(),
                    "in_flight": app.coordinator().in_flight_count(),
                    "signatures": { "total": plain_total, "unsynced": plain_unsynced },
                    "pdf_signatures": { "total": pdf_total, "unsynced": pdf_unsynced },
                }),
            ))
        }
        Action::Connectivity { online } => {
            let restored = app.connectivity().set_online(online);
            Ok(ok_response(
                "connectivity",
                json!({ "online": online, "restored": restored }),
            ))
        }
        Action::SyncNow => {
            let (plain, pdf) = runtime.block_on(async {
                (
                    app.coordinator().attempt_sync().await,
                    app.coordinator().attempt_pdf_sync().await,
                )
            });
            Ok(ok_response(
                "sync_now",
                json!({
                    "signatures": report_json(&plain),
                    "pdf_signatures": report_json(&pdf),
                }),
            ))
        }
        Action::ExportPdfSignature { id, uri } => {
            let record = runtime
                .block_on(app.pdf_signatures().get(id))
                .map_err(|e| crate_error(&e))?
                .ok_or_else(|| format!("record_not_found:{id}"))?;
            let output_path = write_signed_pdf(&record, uri.as_deref())?;
            Ok(ok_response(
                "export_pdf_signature",
                json!({ "id": id, "output_path": output_path.display().to_string() }),
            ))
        }
    }
}

fn read_document(
    fd: &mut FdHandle,
    uri: Option<&str>,
    pdf_base64: Option<&str>,
) -> Result<Vec<u8>, String> {
    if let Some(encoded) = pdf_base64.filter(|s| !s.trim().is_empty()) {
        return B64
            .decode(encoded.trim().as_bytes())
            .map_err(|e| format!("pdf_decode_failed:{e}"));
    }
    #[cfg(unix)]
    {
        if let Some(raw_fd) = fd.take().filter(|fd| *fd >= 0) {
            let mut file = unsafe { File::from_raw_fd(raw_fd as RawFd) };
            let mut buffer = Vec::new();
            file.read_to_end(&mut buffer)
                .map_err(|e| format!("pdf_read_failed:{e}"))?;
            return Ok(buffer);
        }
    }
    #[cfg(not(unix))]
    let _ = fd;
    let path = uri
        .and_then(parse_file_uri_path)
        .ok_or_else(|| "missing_document".to_string())?;
    fs::read(&path).map_err(|e| format!("pdf_read_failed:{e}"))
}

fn write_signed_pdf(record: &PdfSignatureRecord, source_uri: Option<&str>) -> Result<PathBuf, String> {
    let signed = record
        .signed_document_bytes
        .as_ref()
        .ok_or_else(|| "signed_document_missing".to_string())?;
    let safe_doc: String = record
        .document_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    let mut path = output_dir_for(source_uri);
    path.push(format!("signed_{}_{}.pdf", safe_doc, record.id.simple()));
    fs::write(&path, signed).map_err(|e| format!("pdf_save_failed:{e}"))?;
    Ok(path)
}

fn sync_state_label<R: StoredRecord>(app: &SignatureApp, record: &R) -> Value {
    serde_json::to_value(app.coordinator().sync_state(record)).unwrap_or(Value::Null)
}

fn signature_summary(app: &SignatureApp, record: &SignatureRecord) -> Value {
    json!({
        "id": record.id,
        "document_id": record.document_id,
        "document_type": record.document_type,
        "created_at": record.created_at.to_rfc3339(),
        "synced": record.synced,
        "state": sync_state_label(app, record),
        "image_mime": record.signature_image.mime,
        "image_size": record.signature_image.bytes.len(),
    })
}

fn pdf_signature_summary(app: &SignatureApp, record: &PdfSignatureRecord) -> Value {
    json!({
        "id": record.id,
        "document_id": record.document_id,
        "created_at": record.created_at.to_rfc3339(),
        "synced": record.synced,
        "state": sync_state_label(app, record),
        "placement": record.placement,
        "original_size": record.original_document_bytes.len(),
        "signed_size": record.signed_document_bytes.as_ref().map(|b| b.len()),
    })
}

fn report_json(report: &SyncReport) -> Value {
    json!({
        "attempted": report.attempted,
        "acknowledged": report.acknowledged,
        "failed": report.failed,
        "busy": report.busy,
        "skipped": report.skipped.map(|reason| format!("{reason:?}")),
    })
}
