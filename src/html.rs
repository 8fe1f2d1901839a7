use std::{
    cell::{Cell, RefCell},
    io::{self, Write},
    rc::Rc,
};

use bytes::Bytes;
use hyper::{Body, body::HttpBody};
use lol_html::{
    HtmlRewriter, OutputSink, Settings, element, html_content::ContentType, text,
};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::{
    encoding::{ContentCoding, DecodingWriter},
    script::{ScriptSource, rewrite_script},
};

const CHANNEL_DEPTH: usize = 16;

/// What gets spliced into a page.
#[derive(Clone, Debug)]
pub struct HtmlOptions {
    /// Prepended to `<head>`.
    pub head_script: String,
    /// Placed right after `head_script` when set.
    pub service_worker_registration: Option<String>,
    /// Drop `<meta http-equiv="Content-Security-Policy">`.
    pub strip_csp_meta: bool,
}

/// Streams `body` through the HTML rewriter.
///
/// The upstream body is pumped on the runtime while parsing happens on a
/// blocking thread. Both legs use bounded channels, so memory stays flat.
/// A client that goes away closes the output channel; the pump then drops
/// the upstream body and the parser runs out of input.
pub fn rewrite_html_stream(body: Body, coding: ContentCoding, options: HtmlOptions) -> Body {
    let (in_tx, mut in_rx) = mpsc::channel::<io::Result<Bytes>>(CHANNEL_DEPTH);
    let (out_tx, out_rx) = mpsc::channel::<io::Result<Bytes>>(CHANNEL_DEPTH);

    tokio::spawn(pump_body(body, in_tx, out_tx.clone()));

    tokio::task::spawn_blocking(move || {
        let sink_tx = out_tx.clone();
        let input = std::iter::from_fn(|| {
            if out_tx.is_closed() {
                None
            } else {
                in_rx.blocking_recv()
            }
        });
        let result = rewrite_chunks(input, coding, &options, |chunk: &[u8]| {
            if !chunk.is_empty() {
                let _ = sink_tx.blocking_send(Ok(Bytes::copy_from_slice(chunk)));
            }
        });
        if let Err(err) = result {
            warn!(%err, "html rewrite aborted");
            let _ = out_tx.blocking_send(Err(err));
        }
    });

    let stream = futures_util::stream::unfold(out_rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    });
    Body::wrap_stream(stream)
}

async fn pump_body(
    mut body: Body,
    tx: mpsc::Sender<io::Result<Bytes>>,
    client: mpsc::Sender<io::Result<Bytes>>,
) {
    loop {
        let chunk = tokio::select! {
            chunk = body.data() => chunk,
            () = client.closed() => {
                debug!("client went away, dropping upstream html body");
                return;
            }
        };
        let Some(chunk) = chunk else {
            return;
        };
        let item = chunk.map_err(io::Error::other);
        let failed = item.is_err();
        if tx.send(item).await.is_err() || failed {
            return;
        }
    }
}

/// Runs the whole transformation synchronously over `input`, writing the
/// rewritten document to `sink` as it is produced.
pub fn rewrite_chunks<I, O>(
    input: I,
    coding: ContentCoding,
    options: &HtmlOptions,
    sink: O,
) -> io::Result<()>
where
    I: IntoIterator<Item = io::Result<Bytes>>,
    O: FnMut(&[u8]),
{
    // Set by the `<script>` start tag, read by its text chunks. Only the
    // text of the current script is buffered.
    let inline_js = Rc::new(Cell::new(false));
    let text_is_js = Rc::clone(&inline_js);
    let script_text = RefCell::new(String::new());

    let head_block = match &options.service_worker_registration {
        Some(registration) => format!("{}{}", options.head_script, registration),
        None => options.head_script.clone(),
    };
    let strip_csp_meta = options.strip_csp_meta;

    let rewriter = HtmlRewriter::new(
        Settings {
            element_content_handlers: vec![
                element!("head", move |el| {
                    el.prepend(&head_block, ContentType::Html);
                    Ok(())
                }),
                element!("meta", move |el| {
                    if strip_csp_meta
                        && let Some(value) = el.get_attribute("http-equiv")
                        && value.trim().eq_ignore_ascii_case("content-security-policy")
                    {
                        el.remove();
                    }
                    Ok(())
                }),
                element!("script", move |el| {
                    let is_inline = !el.has_attribute("src");
                    let runs_as_js = el
                        .get_attribute("type")
                        .map(|kind| is_javascript_type(&kind))
                        .unwrap_or(true);
                    inline_js.set(is_inline && runs_as_js);
                    Ok(())
                }),
                text!("script", move |chunk| {
                    if !text_is_js.get() {
                        return Ok(());
                    }
                    let mut buf = script_text.borrow_mut();
                    buf.push_str(chunk.as_str());
                    if chunk.last_in_text_node() {
                        let rewritten = rewrite_script(&buf, ScriptSource::Inline);
                        chunk.replace(&rewritten, ContentType::Html);
                        buf.clear();
                    } else {
                        chunk.remove();
                    }
                    Ok(())
                }),
            ],
            ..Settings::default()
        },
        sink,
    );

    let mut writer = DecodingWriter::new(RewriterInput(rewriter), coding)?;
    for chunk in input {
        writer.write_all(&chunk?)?;
    }
    let RewriterInput(rewriter) = writer.finish()?;
    rewriter.end().map_err(io::Error::other)
}

fn is_javascript_type(kind: &str) -> bool {
    let kind = kind.trim().to_ascii_lowercase();
    kind.is_empty()
        || kind == "module"
        || kind.contains("javascript")
        || kind.contains("ecmascript")
}

struct RewriterInput<'h, O: OutputSink>(HtmlRewriter<'h, O>);

impl<O: OutputSink> Write for RewriterInput<'_, O> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf).map_err(io::Error::other)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
