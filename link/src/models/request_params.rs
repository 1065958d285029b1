use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::EdenLinkError;

/// HTTP method of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    /// GET (default)
    #[default]
    Get,
    /// POST
    Post,
    /// PUT
    Put,
    /// PATCH
    Patch,
    /// DELETE
    Delete,
    /// HEAD
    Head,
    /// OPTIONS
    Options,
}

impl HttpMethod {
    /// Upper-case wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Head => "HEAD",
            HttpMethod::Options => "OPTIONS",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HttpMethod {
    type Err = EdenLinkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(HttpMethod::Get),
            "POST" => Ok(HttpMethod::Post),
            "PUT" => Ok(HttpMethod::Put),
            "PATCH" => Ok(HttpMethod::Patch),
            "DELETE" => Ok(HttpMethod::Delete),
            "HEAD" => Ok(HttpMethod::Head),
            "OPTIONS" => Ok(HttpMethod::Options),
            other => Err(EdenLinkError::SerializationError(format!(
                "Unknown HTTP method '{}'",
                other
            ))),
        }
    }
}

/// Binary attachment.
#[derive(Debug, Clone, PartialEq)]
pub struct FilePart {
    /// File name sent in the multipart disposition.
    pub file_name: String,
    /// MIME type, if known.
    pub content_type: Option<String>,
    /// Raw content.
    pub data: Bytes,
}

impl FilePart {
    /// Create a file part.
    pub fn new(file_name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            file_name: file_name.into(),
            content_type: None,
            data: data.into(),
        }
    }

    /// Set the MIME type.
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }
}

/// JSON-like request body that may embed files.
///
/// The `File` variant is an explicit tag: files are located by variant,
/// never by inspecting arbitrary values.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Plain JSON leaf or subtree without files.
    Value(JsonValue),
    /// File attachment.
    File(FilePart),
    /// Object whose members may contain files.
    Object(BTreeMap<String, Payload>),
    /// Array whose items may contain files.
    Array(Vec<Payload>),
}

impl From<JsonValue> for Payload {
    fn from(value: JsonValue) -> Self {
        Payload::Value(value)
    }
}

impl From<FilePart> for Payload {
    fn from(file: FilePart) -> Self {
        Payload::File(file)
    }
}

impl Payload {
    /// Whether any file is embedded.
    pub fn has_files(&self) -> bool {
        match self {
            Payload::Value(_) => false,
            Payload::File(_) => true,
            Payload::Object(map) => map.values().any(Payload::has_files),
            Payload::Array(items) => items.iter().any(Payload::has_files),
        }
    }

    /// Split into plain JSON (files replaced by `null`) and the extracted
    /// files keyed by dotted path (`avatar`, `attachments.0`).
    pub fn extract_files(&self) -> (JsonValue, Vec<(String, FilePart)>) {
        let mut files = Vec::new();
        let json = Self::strip(self, String::new(), &mut files);
        (json, files)
    }

    fn strip(node: &Payload, path: String, files: &mut Vec<(String, FilePart)>) -> JsonValue {
        let join = |key: &str| {
            if path.is_empty() {
                key.to_string()
            } else {
                format!("{}.{}", path, key)
            }
        };
        match node {
            Payload::Value(v) => v.clone(),
            Payload::File(file) => {
                files.push((path, file.clone()));
                JsonValue::Null
            },
            Payload::Object(map) => {
                let mut out = Map::new();
                for (key, child) in map {
                    out.insert(key.clone(), Self::strip(child, join(key), files));
                }
                JsonValue::Object(out)
            },
            Payload::Array(items) => JsonValue::Array(
                items
                    .iter()
                    .enumerate()
                    .map(|(i, child)| Self::strip(child, join(&i.to_string()), files))
                    .collect(),
            ),
        }
    }
}

/// Value of a `multipart/form-data` field.
#[derive(Debug, Clone, PartialEq)]
pub enum FormValue {
    /// Text field.
    Text(String),
    /// File field.
    File(FilePart),
}

/// Request body.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    /// JSON body (files, if any, travel as multipart).
    Json(Payload),
    /// Form fields.
    FormData(Vec<(String, FormValue)>),
}

/// HTTP-shaped parameters of an operation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestParams {
    /// HTTP method.
    pub method: HttpMethod,
    /// Query-string parameters.
    pub query: BTreeMap<String, String>,
    /// Request headers.
    pub headers: BTreeMap<String, String>,
    /// Optional body.
    pub body: Option<RequestBody>,
}

impl RequestParams {
    /// Params with the given method and nothing else.
    pub fn new(method: HttpMethod) -> Self {
        Self {
            method,
            ..Self::default()
        }
    }

    /// GET params.
    pub fn get() -> Self {
        Self::new(HttpMethod::Get)
    }

    /// POST params.
    pub fn post() -> Self {
        Self::new(HttpMethod::Post)
    }

    /// Add a query parameter.
    pub fn query(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.query.insert(key.into(), value.to_string());
        self
    }

    /// Add a header.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Set a JSON body.
    pub fn json(mut self, value: JsonValue) -> Self {
        self.body = Some(RequestBody::Json(Payload::Value(value)));
        self
    }

    /// Set a JSON body that may contain files.
    pub fn payload(mut self, payload: Payload) -> Self {
        self.body = Some(RequestBody::Json(payload));
        self
    }

    /// Set a form body.
    pub fn form(mut self, fields: Vec<(String, FormValue)>) -> Self {
        self.body = Some(RequestBody::FormData(fields));
        self
    }
}
