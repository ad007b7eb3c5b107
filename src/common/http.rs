use easy_error::{Error, ResultExt, bail, err_msg};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

type Reader<'a> = &'a mut (dyn AsyncBufRead + Send + Unpin);

const MAX_HEADERS: usize = 128;
const MAX_LINE: u64 = 8192;
const SENSITIVE_HEADERS: [&str; 2] = ["proxy-authorization", "authorization"];

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct HttpRequest {
    pub method: String,
    pub resource: String,
    pub version: String,
    pub headers: Vec<(String, String)>,
}

impl HttpRequest {
    pub fn new(method: impl Into<String>, resource: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            resource: resource.into(),
            version: "HTTP/1.1".into(),
            headers: vec![],
        }
    }

    /// Sets a header, replacing any previous value with the same name.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let name = name.into();
        self.headers.retain(|(k, _)| !k.eq_ignore_ascii_case(&name));
        self.headers.push((name, value.into()));
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        header(&self.headers, name)
    }

    pub async fn read_from(socket: Reader<'_>) -> Result<Self, Error> {
        let buf = read_line(socket).await?;
        let buf = buf.trim_end();
        let a: Vec<&str> = buf.split_ascii_whitespace().collect();
        trace!("request={}", buf);
        if a.len() != 3 || !a[2].starts_with("HTTP/") {
            bail!("bad request: {:?}", buf);
        }
        let mut ret = Self {
            method: a[0].into(),
            resource: a[1].into(),
            version: a[2].into(),
            headers: vec![],
        };
        read_headers(&mut ret.headers, socket).await?;
        Ok(ret)
    }

    pub async fn write_to<W>(&self, socket: &mut W) -> Result<(), Error>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        socket
            .write_all(self.to_string().as_bytes())
            .await
            .context("write request")?;
        socket.flush().await.context("flush")
    }

    /// Request head with credentials masked, for diagnostics.
    pub fn redacted(&self) -> String {
        let mut s = format!("{} {} {}\r\n", self.method, self.resource, self.version);
        for (k, v) in &self.headers {
            let v = if SENSITIVE_HEADERS.contains(&k.to_ascii_lowercase().as_str()) {
                "<redacted>"
            } else {
                v.as_str()
            };
            s += &format!("{}: {}\r\n", k, v);
        }
        s
    }
}

impl std::fmt::Display for HttpRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} {}\r\n", self.method, self.resource, self.version)?;
        for (k, v) in &self.headers {
            write!(f, "{}: {}\r\n", k, v)?;
        }
        f.write_str("\r\n")
    }
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct HttpResponse {
    pub version: String,
    pub code: u16,
    pub status: String,
    pub headers: Vec<(String, String)>,
}

impl HttpResponse {
    /// Reads exactly one response head. The body, if any, is left unread.
    pub async fn read_from(socket: Reader<'_>) -> Result<Self, Error> {
        let buf = read_line(socket).await?;
        let buf = buf.trim_end();
        trace!("response={}", buf);
        let mut a = buf.splitn(3, ' ');
        let version = a.next().unwrap_or_default();
        if !version.starts_with("HTTP/") {
            bail!("bad response: {:?}", buf);
        }
        let code = a
            .next()
            .ok_or_else(|| err_msg("missing response code"))?
            .parse()
            .context("failed to parse response code")?;
        let status = a.next().unwrap_or_default();
        let mut ret = Self {
            version: version.into(),
            code,
            status: status.into(),
            headers: vec![],
        };
        read_headers(&mut ret.headers, socket).await?;
        Ok(ret)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        header(&self.headers, name)
    }

    /// Status code and reason phrase, e.g. `407 Proxy Authentication Required`.
    pub fn status_line(&self) -> String {
        if self.status.is_empty() {
            self.code.to_string()
        } else {
            format!("{} {}", self.code, self.status)
        }
    }

    pub fn head(&self) -> String {
        let mut s = format!("{} {}\r\n", self.version, self.status_line());
        for (k, v) in &self.headers {
            s += &format!("{}: {}\r\n", k, v);
        }
        s
    }
}

fn header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

async fn read_headers(
    headers: &mut Vec<(String, String)>,
    socket: Reader<'_>,
) -> Result<(), Error> {
    loop {
        let buf = read_line(socket).await?;
        let buf = buf.trim_end();
        trace!("header={}", buf);
        if buf.is_empty() {
            return Ok(());
        };
        if headers.len() >= MAX_HEADERS {
            bail!("too many headers");
        }
        let (k, v) = buf
            .split_once(':')
            .ok_or_else(|| err_msg(format!("bad header: {:?}", buf)))?;
        headers.push((k.trim().to_owned(), v.trim().to_owned()))
    }
}

async fn read_line(s: Reader<'_>) -> Result<String, Error> {
    let mut buf = String::with_capacity(256);
    let sz = s.take(MAX_LINE).read_line(&mut buf).await.context("readline")?;
    match sz {
        0 => Err(err_msg("EOF")),
        n if n as u64 == MAX_LINE && !buf.ends_with('\n') => {
            bail!("line exceeds {} bytes", MAX_LINE)
        }
        _ => Ok(buf),
    }
}
