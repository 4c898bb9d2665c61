//! The HTTP listener and per-method dispatch.
//!
//! DAV verbs arrive as arbitrary method tokens, so dispatch matches on the
//! raw method string rather than a fixed verb enum. Request bodies are
//! reduced to the structured forms the core consumes; the heavy lifting
//! (changeset replay, prefetch, report generation) happens behind those
//! forms. Non-fatal failures turn into DAV error envelopes with a numeric
//! code; fatal mid-stream failures close the stream so the client sees
//! truncation rather than a parse error.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use http_body_util::{BodyExt, Full};
use hyper::{
    body::{Bytes, Incoming},
    header,
    server::conn::http1,
    service::service_fn,
    Request, Response, StatusCode,
};
use hyper_util::rt::TokioIo;
use md5::{Digest, Md5};
use svn_bridge_cache::MetadataCache;
use svn_bridge_diff::{ClientState, UpdateDiffEngine};
use svn_bridge_loader::ItemLoader;
use svn_bridge_model::{FolderNode, ItemMeta};
use svn_bridge_source::{
    Credentials, DeletedState, ItemType, Recursion, SourceControl, SourceItemKind, VersionSpec,
};
use svn_path::CasePolicy;
use tokio::{net::TcpListener, task};

use crate::{error::Error, report};

const WORK_PREFIX: &str = "/!svn/wrk/";

/// The collaborators one request needs, constructed once in `main` and
/// shared by every connection.
pub(crate) struct Bridge {
    source: Arc<dyn SourceControl>,
    cache: Arc<MetadataCache>,
    creds: Credentials,
    policy: CasePolicy,
    loader_config: svn_bridge_loader::Config,
}

impl Bridge {
    pub(crate) fn new(
        source: Arc<dyn SourceControl>,
        cache: Arc<MetadataCache>,
        creds: Credentials,
        policy: CasePolicy,
        loader_config: svn_bridge_loader::Config,
    ) -> Self {
        Self {
            source,
            cache,
            creds,
            policy,
            loader_config,
        }
    }
}

pub(crate) async fn serve(addr: SocketAddr, bridge: Arc<Bridge>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    log::info!("listening on {}", addr);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                log::info!("shutting down");
                return Ok(());
            }
            accepted = listener.accept() => {
                let (stream, remote) = accepted?;
                let bridge = bridge.clone();

                task::spawn(async move {
                    let service = service_fn(move |req| {
                        let bridge = bridge.clone();
                        async move { handle(bridge, req).await }
                    });

                    if let Err(e) = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await
                    {
                        log::debug!("connection from {} ended: {}", remote, e);
                    }
                });
            }
        }
    }
}

async fn handle(
    bridge: Arc<Bridge>,
    req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, std::convert::Infallible> {
    let method = req.method().as_str().to_string();
    log::trace!("{} {}", method, req.uri().path());

    let result = match method.as_str() {
        "OPTIONS" => Ok(options_response()),
        "PROPFIND" => propfind(&bridge, req).await,
        "REPORT" => update_report(&bridge, req).await,
        "PUT" => put(&bridge, req).await,
        "MKCOL" => mkcol(&bridge, req).await,
        _ => Err(Error::UnsupportedProtocolPath(format!(
            "{} {}",
            method,
            req.uri().path()
        ))),
    };

    Ok(result.unwrap_or_else(|e| {
        log::warn!("{} failed: {}", method, e);
        xml_response(e.status(), e.envelope())
    }))
}

fn options_response() -> Response<Full<Bytes>> {
    build_response(
        Response::builder()
            .status(StatusCode::OK)
            .header("DAV", "1,2")
            .header("DAV", "version-control,checkout,working-resource")
            .header(header::ALLOW, "OPTIONS,PROPFIND,REPORT,PUT,MKCOL"),
        Bytes::new(),
    )
}

async fn propfind(
    bridge: &Bridge,
    req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, Error> {
    let depth = parse_depth(req.headers())?;
    let dav_path = svn_path::decode_uri(req.uri().path())?;
    let server_path = to_server_path(&dav_path);

    let items = bridge
        .source
        .query_items(
            &bridge.creds,
            &server_path,
            depth,
            VersionSpec::Latest,
            DeletedState::NonDeleted,
            ItemType::Any,
        )
        .await?;

    if items.is_empty() {
        return Err(Error::NotFound(server_path));
    }

    let mut xml = String::from(
        "<?xml version=\"1.0\" encoding=\"utf-8\"?>\n\
         <D:multistatus xmlns:D=\"DAV:\" xmlns:S=\"svn:\" \
         xmlns:V=\"http://subversion.tigris.org/xmlns/dav/\">\n",
    );

    for item in &items {
        let href = svn_path::encode_uri(&to_dav_path(&item.remote_name));
        let resourcetype = match item.kind {
            SourceItemKind::Folder => "<D:collection/>",
            SourceItemKind::File => "",
        };

        xml.push_str(&format!(
            "<D:response>\n\
             <D:href>{}</D:href>\n\
             <D:propstat><D:prop>\
             <D:resourcetype>{}</D:resourcetype>\
             <D:version-name>{}</D:version-name>\
             <D:creator-displayname>{}</D:creator-displayname>\
             </D:prop>\
             <D:status>HTTP/1.1 200 OK</D:status></D:propstat>\n\
             </D:response>\n",
            svn_path::escape_xml(&href),
            resourcetype,
            item.revision,
            svn_path::escape_xml(&item.author),
        ));
    }

    xml.push_str("</D:multistatus>\n");
    Ok(xml_response(StatusCode::MULTI_STATUS, xml))
}

async fn put(bridge: &Bridge, req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Error> {
    let raw_path = req.uri().path().to_string();
    let (activity, item_path) = parse_work_path(&raw_path)?;
    let location = location_for(req.headers(), &raw_path);

    let expected_md5 = req
        .headers()
        .get("X-SVN-Result-Fulltext-MD5")
        .and_then(|value| value.to_str().ok())
        .map(str::to_lowercase);

    let body = req.into_body().collect().await?.to_bytes();

    // A client that sends no hash skips the end-to-end check; some clients
    // legitimately omit it.
    if let Some(expected) = expected_md5 {
        let computed = hex::encode(Md5::digest(&body));
        if computed != expected {
            return Err(Error::ChecksumMismatch {
                expected,
                computed,
            });
        }
    }

    let created = bridge
        .source
        .write_file(&bridge.creds, &activity, &item_path, body)
        .await?;

    Ok(if created {
        created_response(location)
    } else {
        build_response(Response::builder().status(StatusCode::NO_CONTENT), Bytes::new())
    })
}

async fn mkcol(bridge: &Bridge, req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Error> {
    let raw_path = req.uri().path().to_string();
    let (activity, item_path) = parse_work_path(&raw_path)?;
    let location = location_for(req.headers(), &raw_path);

    bridge
        .source
        .make_collection(&bridge.creds, &activity, &item_path)
        .await?;

    Ok(created_response(location))
}

async fn update_report(
    bridge: &Bridge,
    req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, Error> {
    let body = req.into_body().collect().await?.to_bytes();
    let body = String::from_utf8_lossy(&body).into_owned();
    let request = parse_update_report(&body)?;

    let xml = run_update(bridge, request).await?;
    Ok(xml_response(StatusCode::OK, xml))
}

/// The structured form of an update-report request body.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct UpdateRequest {
    /// Checkout root as a server path.
    pub(crate) checkout_root: String,

    pub(crate) target_revision: i64,

    /// `(checkout-relative path, revision)` pairs the client reports.
    pub(crate) entries: Vec<(String, i64)>,

    /// Paths the client has locally marked absent.
    pub(crate) missing: Vec<String>,

    /// True when the request declared the custom-properties namespace.
    pub(crate) extended_namespaces: bool,
}

/// Drives one update: replay the changeset range onto a fresh tree, then
/// stream it through the report generator while the loader prefetches
/// content in the background.
pub(crate) async fn run_update(bridge: &Bridge, request: UpdateRequest) -> Result<String, Error> {
    let target = request.target_revision;
    let base = request
        .entries
        .iter()
        .map(|(_path, revision)| *revision)
        .min()
        .unwrap_or(0);

    let mut client = ClientState::new(bridge.policy);
    for (rel, revision) in &request.entries {
        let path = if rel.is_empty() {
            request.checkout_root.clone()
        } else {
            svn_path::join(&request.checkout_root, rel)
        };
        client.add_existing(&path, *revision);
    }
    for rel in &request.missing {
        let path = svn_path::join(&request.checkout_root, rel);
        client.add_missing(&path, "");
    }

    let changesets = bridge
        .source
        .query_changesets(
            &bridge.creds,
            &request.checkout_root,
            base.min(target),
            base.max(target),
        )
        .await?;

    let root_meta = bridge
        .cache
        .query_items(target, &request.checkout_root, Recursion::None)
        .await?
        .into_iter()
        .next()
        .map(|item| ItemMeta::from_source(&item))
        .unwrap_or_else(|| ItemMeta::synthetic(&request.checkout_root, target));

    let mut engine = UpdateDiffEngine::new(
        FolderNode::new(root_meta),
        request.checkout_root.clone(),
        target,
        client,
        bridge.creds.clone(),
        bridge.policy,
        bridge.cache.clone(),
        bridge.source.clone(),
    );
    engine.replay(&changesets, target >= base).await?;
    let tree = engine.finalize().await?;

    let loader = ItemLoader::new(
        bridge.loader_config.clone(),
        bridge.creds.clone(),
        bridge.source.clone(),
        &tree,
    );
    let producer = {
        let loader = loader.clone();
        task::spawn(async move { loader.start().await })
    };

    let generated = report::generate(
        &tree,
        &loader,
        target,
        Duration::from_secs(30 * 60),
        request.extended_namespaces,
    )
    .await;

    // The generator consumed everything it needed; anything still pending
    // is drained, not aborted.
    loader.cancel();
    match producer.await {
        Ok(Ok(())) | Ok(Err(svn_bridge_loader::Error::Cancelled)) => {}
        Ok(Err(e)) => log::warn!("prefetch ended abnormally: {}", e),
        Err(e) => log::warn!("prefetch task failed: {}", e),
    }

    generated
}

pub(crate) fn parse_depth(headers: &header::HeaderMap) -> Result<Recursion, Error> {
    let value = match headers.get("Depth") {
        None => return Ok(Recursion::Full),
        Some(value) => value,
    };

    match value.to_str().unwrap_or("") {
        "0" => Ok(Recursion::None),
        "1" => Ok(Recursion::OneLevel),
        "infinity" => Ok(Recursion::Full),
        other => Err(Error::UnsupportedDepth(other.into())),
    }
}

/// Maps a decoded DAV path to a server path.
fn to_server_path(dav_path: &str) -> String {
    let trimmed = dav_path.trim_end_matches('/');
    if trimmed.is_empty() {
        svn_path::SERVER_ROOT.into()
    } else {
        format!("{}{}", svn_path::ROOT_SIGIL, trimmed)
    }
}

fn to_dav_path(server_path: &str) -> String {
    server_path
        .strip_prefix(svn_path::ROOT_SIGIL)
        .unwrap_or(server_path)
        .to_string()
}

/// Splits a working-resource URL into its activity and server path.
fn parse_work_path(raw_path: &str) -> Result<(String, String), Error> {
    let rest = raw_path
        .strip_prefix(WORK_PREFIX)
        .ok_or_else(|| Error::UnsupportedProtocolPath(raw_path.into()))?;

    let mut split = rest.splitn(2, '/');
    let activity = split.next().unwrap_or("");
    let item = split.next().unwrap_or("");
    if activity.is_empty() || item.is_empty() {
        return Err(Error::UnsupportedProtocolPath(raw_path.into()));
    }

    Ok((
        svn_path::decode_uri(activity)?,
        to_server_path(&format!("/{}", svn_path::decode_uri(item)?)),
    ))
}

/// Synthesizes the Location echo from the request host.
fn location_for(headers: &header::HeaderMap, raw_path: &str) -> Option<String> {
    headers
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .map(|host| format!("http://{}{}", host, raw_path))
}

fn created_response(location: Option<String>) -> Response<Full<Bytes>> {
    let mut builder = Response::builder().status(StatusCode::CREATED);
    if let Some(location) = location {
        builder = builder.header(header::LOCATION, location);
    }
    build_response(builder, Bytes::new())
}

fn xml_response(status: StatusCode, xml: String) -> Response<Full<Bytes>> {
    build_response(
        Response::builder()
            .status(status)
            .header(header::CONTENT_TYPE, "text/xml; charset=\"utf-8\""),
        Bytes::from(xml),
    )
}

fn build_response(builder: hyper::http::response::Builder, body: Bytes) -> Response<Full<Bytes>> {
    // Static parts only; the builder cannot fail here.
    builder.body(Full::new(body)).unwrap()
}

pub(crate) fn parse_update_report(body: &str) -> Result<UpdateRequest, Error> {
    let src_path = tag_text(body, "src-path")
        .ok_or_else(|| Error::MalformedBody(String::from("missing src-path")))?;
    let checkout_root = to_server_path(&svn_path::decode_uri(&url_path_of(&src_path))?);

    let target_revision = tag_text(body, "target-revision")
        .ok_or_else(|| Error::MalformedBody(String::from("missing target-revision")))?
        .trim()
        .parse::<i64>()
        .map_err(|e| Error::MalformedBody(format!("bad target-revision: {}", e)))?;

    let mut entries = Vec::new();
    for (attrs, text) in tag_all(body, "entry") {
        let revision = attr_value(&attrs, "rev")
            .ok_or_else(|| Error::MalformedBody(String::from("entry without rev")))?
            .parse::<i64>()
            .map_err(|e| Error::MalformedBody(format!("bad entry rev: {}", e)))?;
        entries.push((svn_path::unescape_xml(&text)?, revision));
    }

    let mut missing = Vec::new();
    for (_attrs, text) in tag_all(body, "missing") {
        missing.push(svn_path::unescape_xml(&text)?);
    }

    Ok(UpdateRequest {
        checkout_root,
        target_revision,
        entries,
        missing,
        extended_namespaces: body.contains("http://subversion.tigris.org/xmlns/custom/"),
    })
}

/// The path portion of an absolute URL; pass-through for bare paths.
fn url_path_of(url: &str) -> String {
    if let Some(idx) = url.find("://") {
        let rest = &url[idx + 3..];
        match rest.find('/') {
            Some(slash) => rest[slash..].to_string(),
            None => String::from("/"),
        }
    } else {
        url.to_string()
    }
}

/// First `<*:tag>text</*:tag>` occurrence, ignoring the namespace prefix.
fn tag_text(body: &str, tag: &str) -> Option<String> {
    tag_all(body, tag).into_iter().next().map(|(_attrs, text)| text)
}

/// Every `<*:tag attrs>text</*:tag>` occurrence as `(attrs, text)`.
/// Self-closing tags yield empty text.
fn tag_all(body: &str, tag: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    let open = format!(":{}", tag);
    let mut rest = body;

    while let Some(start) = rest.find('<') {
        rest = &rest[start + 1..];

        let name_end = match rest.find(|c: char| c.is_whitespace() || c == '>' || c == '/') {
            Some(idx) => idx,
            None => break,
        };
        let name = &rest[..name_end];
        if !name.ends_with(&open) && name != tag {
            continue;
        }

        let tag_end = match rest.find('>') {
            Some(idx) => idx,
            None => break,
        };
        let attrs = rest[name_end..tag_end].trim().to_string();

        if rest[..tag_end].ends_with('/') {
            out.push((attrs.trim_end_matches('/').trim().to_string(), String::new()));
            rest = &rest[tag_end + 1..];
            continue;
        }

        let content = &rest[tag_end + 1..];
        let close_a = format!("</{}>", name);
        match content.find(&close_a) {
            Some(idx) => {
                out.push((attrs, content[..idx].to_string()));
                rest = &content[idx + close_a.len()..];
            }
            None => break,
        }
    }

    out
}

/// The value of `name="..."` inside an attribute string.
fn attr_value(attrs: &str, name: &str) -> Option<String> {
    let marker = format!("{}=\"", name);
    let start = attrs.find(&marker)? + marker.len();
    let end = attrs[start..].find('"')?;
    Some(attrs[start..start + end].to_string())
}
