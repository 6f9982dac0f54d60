use std::net::IpAddr;
use std::pin::Pin;

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use http::{HeaderMap, Method, StatusCode, Uri};
use url::Url;

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, std::io::Error>> + Send>>;

pub enum RequestBody {
    Empty,
    Bytes(Bytes),
    Stream(ByteStream),
}

impl std::fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestBody::Empty => write!(f, "Empty"),
            RequestBody::Bytes(bytes) => write!(f, "Bytes({})", bytes.len()),
            RequestBody::Stream(_) => write!(f, "Stream"),
        }
    }
}

impl From<Bytes> for RequestBody {
    fn from(bytes: Bytes) -> Self {
        if bytes.is_empty() {
            RequestBody::Empty
        } else {
            RequestBody::Bytes(bytes)
        }
    }
}

pub enum ResponseBody {
    Bytes(Bytes),
    Stream(ByteStream),
}

impl std::fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResponseBody::Bytes(bytes) => write!(f, "Bytes({})", bytes.len()),
            ResponseBody::Stream(_) => write!(f, "Stream"),
        }
    }
}

impl ResponseBody {
    /// Drains the body. Stream errors end the read early.
    pub async fn into_bytes_async(self) -> Vec<u8> {
        match self {
            ResponseBody::Bytes(bytes) => bytes.to_vec(),
            ResponseBody::Stream(mut stream) => {
                let mut out = Vec::new();
                while let Some(Ok(chunk)) = stream.next().await {
                    out.extend_from_slice(&chunk);
                }
                out
            }
        }
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self, ResponseBody::Stream(_))
    }

    pub fn into_stream(self) -> ByteStream {
        match self {
            ResponseBody::Bytes(bytes) => Box::pin(futures_util::stream::once(async move {
                Ok::<_, std::io::Error>(bytes)
            })),
            ResponseBody::Stream(stream) => stream,
        }
    }
}

/// Connection facts used for the `Forwarded` header.
#[derive(Clone, Debug, Default)]
pub struct ClientInfo {
    pub remote_ip: Option<IpAddr>,
    pub scheme: String,
    pub host: Option<String>,
}

/// An inbound request addressed to `/adapters/{adapter}/...`.
#[derive(Debug)]
pub struct ProxyRequest {
    pub adapter: String,
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: RequestBody,
    pub client: ClientInfo,
}

#[derive(Debug)]
pub struct UpstreamRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: RequestBody,
}

#[derive(Debug)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: ResponseBody,
}

#[derive(Debug)]
pub struct ProxyResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: ResponseBody,
}
