//! Compact binary encodings for store events
//!
//! The wire representation is optimized for size over a constrained
//! transport, not for storage: strings are length-prefixed, optionals are a
//! single flag byte, raw body buffers travel untouched. All integers are
//! big-endian. Decoders read fields in declaration order and ignore unknown
//! trailing bytes, so new optional fields can be appended without breaking
//! old readers; a decoder that runs out of bytes at an optional tail field
//! defaults it to empty/zero.

use bytes::BufMut;
use uuid::Uuid;

use crate::error::DecodeError;
use crate::events::{
    MessageStored, NetworkTaskCompleted, NetworkTaskCreated, NetworkTaskProgressUpdated,
};
use crate::model::{
    CachePolicy, FetchKind, Level, RequestOptions, TaskError, TaskKind, TaskRequest, TaskResponse,
    TransactionMetrics,
};

type DecodeResult<T> = std::result::Result<T, DecodeError>;

/// Bounds-checked cursor over a packet body
pub(crate) struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn take(&mut self, n: usize) -> DecodeResult<&'a [u8]> {
        if self.buf.len() < n {
            return Err(DecodeError::Truncated {
                needed: n,
                available: self.buf.len(),
            });
        }
        let (head, rest) = self.buf.split_at(n);
        self.buf = rest;
        Ok(head)
    }

    pub(crate) fn u8(&mut self) -> DecodeResult<u8> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn u16(&mut self) -> DecodeResult<u16> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    pub(crate) fn u32(&mut self) -> DecodeResult<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub(crate) fn u64(&mut self) -> DecodeResult<u64> {
        let bytes = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        Ok(u64::from_be_bytes(raw))
    }

    pub(crate) fn i64(&mut self) -> DecodeResult<i64> {
        Ok(self.u64()? as i64)
    }

    pub(crate) fn uuid(&mut self) -> DecodeResult<Uuid> {
        let bytes = self.take(16)?;
        let mut raw = [0u8; 16];
        raw.copy_from_slice(bytes);
        Ok(Uuid::from_bytes(raw))
    }

    /// String with a u16 length prefix
    pub(crate) fn str16(&mut self) -> DecodeResult<String> {
        let len = self.u16()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| DecodeError::InvalidUtf8)
    }

    /// String with a u32 length prefix
    pub(crate) fn str32(&mut self) -> DecodeResult<String> {
        let len = self.u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| DecodeError::InvalidUtf8)
    }

    /// Byte buffer with a u32 length prefix
    pub(crate) fn bytes32(&mut self) -> DecodeResult<Vec<u8>> {
        let len = self.u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    /// Flagged optional: a zero byte means absent
    pub(crate) fn opt<T>(
        &mut self,
        read: impl FnOnce(&mut Self) -> DecodeResult<T>,
    ) -> DecodeResult<Option<T>> {
        if self.u8()? == 0 {
            Ok(None)
        } else {
            read(self).map(Some)
        }
    }
}

/// Growable encode buffer
pub(crate) struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub(crate) fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub(crate) fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub(crate) fn u8(&mut self, value: u8) {
        self.buf.put_u8(value);
    }

    pub(crate) fn u16(&mut self, value: u16) {
        self.buf.put_u16(value);
    }

    pub(crate) fn u32(&mut self, value: u32) {
        self.buf.put_u32(value);
    }

    pub(crate) fn u64(&mut self, value: u64) {
        self.buf.put_u64(value);
    }

    pub(crate) fn i64(&mut self, value: i64) {
        self.buf.put_i64(value);
    }

    pub(crate) fn uuid(&mut self, value: &Uuid) {
        self.buf.put_slice(value.as_bytes());
    }

    pub(crate) fn str16(&mut self, value: &str) {
        let bytes = value.as_bytes();
        let len = bytes.len().min(u16::MAX as usize);
        self.buf.put_u16(len as u16);
        self.buf.put_slice(&bytes[..len]);
    }

    pub(crate) fn str32(&mut self, value: &str) {
        let bytes = value.as_bytes();
        self.buf.put_u32(bytes.len() as u32);
        self.buf.put_slice(bytes);
    }

    pub(crate) fn bytes32(&mut self, value: &[u8]) {
        self.buf.put_u32(value.len() as u32);
        self.buf.put_slice(value);
    }

    pub(crate) fn opt<T>(&mut self, value: Option<&T>, write: impl FnOnce(&mut Self, &T)) {
        match value {
            Some(value) => {
                self.buf.put_u8(1);
                write(self, value);
            }
            None => self.buf.put_u8(0),
        }
    }
}

// ---- Sub-record codecs ----

fn put_headers(w: &mut Writer, headers: &[(String, String)]) {
    w.u16(headers.len() as u16);
    for (name, value) in headers {
        w.str16(name);
        w.str16(value);
    }
}

fn get_headers(r: &mut Reader<'_>) -> DecodeResult<Vec<(String, String)>> {
    let count = r.u16()? as usize;
    let mut headers = Vec::with_capacity(count.min(256));
    for _ in 0..count {
        let name = r.str16()?;
        let value = r.str16()?;
        headers.push((name, value));
    }
    Ok(headers)
}

fn put_request(w: &mut Writer, request: &TaskRequest) {
    w.str16(&request.url);
    w.str16(&request.http_method);
    w.u8(request.cache_policy.as_u8());
    w.u8(request.options.to_bits());
    put_headers(w, &request.headers);
}

fn get_request(r: &mut Reader<'_>) -> DecodeResult<TaskRequest> {
    let url = r.str16()?;
    let http_method = r.str16()?;
    let cache_policy =
        CachePolicy::from_u8(r.u8()?).ok_or(DecodeError::InvalidValue("cache_policy"))?;
    let options = RequestOptions::from_bits(r.u8()?);
    let headers = get_headers(r)?;
    Ok(TaskRequest {
        url,
        http_method,
        headers,
        cache_policy,
        options,
    })
}

fn put_response(w: &mut Writer, response: &TaskResponse) {
    w.u16(response.status);
    put_headers(w, &response.headers);
}

fn get_response(r: &mut Reader<'_>) -> DecodeResult<TaskResponse> {
    let status = r.u16()?;
    let headers = get_headers(r)?;
    Ok(TaskResponse { status, headers })
}

fn put_error(w: &mut Writer, error: &TaskError) {
    w.str16(&error.domain);
    w.i64(error.code);
    w.str32(&error.debug_description);
}

fn get_error(r: &mut Reader<'_>) -> DecodeResult<TaskError> {
    let domain = r.str16()?;
    let code = r.i64()?;
    let debug_description = r.str32()?;
    Ok(TaskError {
        domain,
        code,
        debug_description,
    })
}

fn put_metrics(w: &mut Writer, metrics: &TransactionMetrics) {
    w.u8(metrics.fetch_kind.as_u8());
    w.u64(metrics.fetch_start);
    w.u64(metrics.request_start);
    w.u64(metrics.response_start);
    w.u64(metrics.response_end);
    w.u64(metrics.request_header_bytes);
    w.u64(metrics.request_body_bytes);
    w.u64(metrics.response_header_bytes);
    w.u64(metrics.response_body_bytes);
    w.str16(&metrics.network_protocol);
    w.str16(&metrics.remote_address);
    w.opt(metrics.tls_version.as_ref(), |w, v| w.str16(v));
    w.u8(u8::from(metrics.is_reused_connection));
}

fn get_metrics(r: &mut Reader<'_>) -> DecodeResult<TransactionMetrics> {
    let fetch_kind = FetchKind::from_u8(r.u8()?).ok_or(DecodeError::InvalidValue("fetch_kind"))?;
    let fetch_start = r.u64()?;
    let request_start = r.u64()?;
    let response_start = r.u64()?;
    let response_end = r.u64()?;
    let request_header_bytes = r.u64()?;
    let request_body_bytes = r.u64()?;
    let response_header_bytes = r.u64()?;
    let response_body_bytes = r.u64()?;
    let network_protocol = r.str16()?;
    let remote_address = r.str16()?;
    let tls_version = r.opt(Reader::str16)?;
    let is_reused_connection = r.u8()? != 0;
    Ok(TransactionMetrics {
        fetch_kind,
        fetch_start,
        request_start,
        response_start,
        response_end,
        request_header_bytes,
        request_body_bytes,
        response_header_bytes,
        response_body_bytes,
        network_protocol,
        remote_address,
        tls_version,
        is_reused_connection,
    })
}

// ---- Event codecs ----

pub(crate) fn encode_message_stored(event: &MessageStored) -> Vec<u8> {
    let mut w = Writer::new();
    w.u64(event.created_at);
    w.u8(event.level.as_u8());
    w.u32(event.line);
    w.uuid(&event.session_id);
    w.str16(&event.label);
    w.str32(&event.text);
    w.str16(&event.file);
    w.str16(&event.function);
    w.u16(event.metadata.len() as u16);
    for (key, value) in &event.metadata {
        w.str16(key);
        w.str32(value);
    }
    w.into_bytes()
}

pub(crate) fn decode_message_stored(body: &[u8]) -> DecodeResult<MessageStored> {
    let mut r = Reader::new(body);
    let created_at = r.u64()?;
    let level = Level::from_u8(r.u8()?).ok_or(DecodeError::InvalidValue("level"))?;
    let line = r.u32()?;
    let session_id = r.uuid()?;
    let label = r.str16()?;
    let text = r.str32()?;
    let file = r.str16()?;
    let function = r.str16()?;

    // Optional tail: older encoders didn't send metadata
    let metadata = if r.is_empty() {
        Vec::new()
    } else {
        let count = r.u16()? as usize;
        let mut metadata = Vec::with_capacity(count.min(64));
        for _ in 0..count {
            let key = r.str16()?;
            let value = r.str32()?;
            metadata.push((key, value));
        }
        metadata
    };

    Ok(MessageStored {
        created_at,
        level,
        label,
        text,
        metadata,
        session_id,
        file,
        function,
        line,
    })
}

pub(crate) fn encode_task_created(event: &NetworkTaskCreated) -> Vec<u8> {
    let mut w = Writer::new();
    w.uuid(&event.task_id);
    w.u8(event.kind.as_u8());
    w.u64(event.created_at);
    w.uuid(&event.session_id);
    put_request(&mut w, &event.request);
    w.into_bytes()
}

pub(crate) fn decode_task_created(body: &[u8]) -> DecodeResult<NetworkTaskCreated> {
    let mut r = Reader::new(body);
    let task_id = r.uuid()?;
    let kind = TaskKind::from_u8(r.u8()?).ok_or(DecodeError::InvalidValue("task_kind"))?;
    let created_at = r.u64()?;
    let session_id = r.uuid()?;
    let request = get_request(&mut r)?;
    Ok(NetworkTaskCreated {
        task_id,
        kind,
        created_at,
        request,
        session_id,
    })
}

pub(crate) fn encode_task_progress(event: &NetworkTaskProgressUpdated) -> Vec<u8> {
    let mut w = Writer::new();
    w.uuid(&event.task_id);
    w.i64(event.completed);
    w.i64(event.total);
    w.into_bytes()
}

pub(crate) fn decode_task_progress(body: &[u8]) -> DecodeResult<NetworkTaskProgressUpdated> {
    let mut r = Reader::new(body);
    let task_id = r.uuid()?;
    let completed = r.i64()?;
    let total = r.i64()?;
    Ok(NetworkTaskProgressUpdated {
        task_id,
        completed,
        total,
    })
}

pub(crate) fn encode_task_completed(event: &NetworkTaskCompleted) -> Vec<u8> {
    let mut w = Writer::new();
    w.uuid(&event.task_id);
    w.u8(event.kind.as_u8());
    w.u64(event.created_at);
    w.uuid(&event.session_id);
    w.u64(event.duration_ns);
    put_request(&mut w, &event.request);
    w.opt(event.response.as_ref(), put_response);
    w.opt(event.error.as_ref(), put_error);
    w.u16(event.metrics.len() as u16);
    for metrics in &event.metrics {
        put_metrics(&mut w, metrics);
    }
    w.opt(event.request_body.as_ref(), |w, body| w.bytes32(body));
    w.opt(event.response_body.as_ref(), |w, body| w.bytes32(body));
    w.into_bytes()
}

pub(crate) fn decode_task_completed(body: &[u8]) -> DecodeResult<NetworkTaskCompleted> {
    let mut r = Reader::new(body);
    let task_id = r.uuid()?;
    let kind = TaskKind::from_u8(r.u8()?).ok_or(DecodeError::InvalidValue("task_kind"))?;
    let created_at = r.u64()?;
    let session_id = r.uuid()?;
    let duration_ns = r.u64()?;
    let request = get_request(&mut r)?;
    let response = r.opt(get_response)?;
    let error = r.opt(get_error)?;

    let count = r.u16()? as usize;
    let mut metrics = Vec::with_capacity(count.min(64));
    for _ in 0..count {
        metrics.push(get_metrics(&mut r)?);
    }

    // Optional tail: body buffers may be absent entirely on older encoders
    let request_body = if r.is_empty() {
        None
    } else {
        r.opt(Reader::bytes32)?
    };
    let response_body = if r.is_empty() {
        None
    } else {
        r.opt(Reader::bytes32)?
    };

    Ok(NetworkTaskCompleted {
        task_id,
        kind,
        created_at,
        session_id,
        duration_ns,
        request,
        response,
        error,
        request_body,
        response_body,
        metrics,
    })
}
