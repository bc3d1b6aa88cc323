//! Directory-trie request routing with browseable listings.

// std
use std::{
	collections::{BTreeMap, HashMap},
	net::SocketAddr,
	pin::Pin,
};
// crates.io
use http::{HeaderMap, HeaderValue, Method, Response, StatusCode, Uri, header};
use serde_json::{Map, Value};
// self
use crate::_prelude::*;

/// Header required on every metadata path.
pub const METADATA_FLAVOR: &str = "Metadata-Flavor";
/// The only accepted flavor value.
pub const METADATA_FLAVOR_VALUE: &str = "Google";
/// `Server` header advertised on successful responses.
pub const SERVER_VALUE: &str = "Metadata Server";
/// Path prefix gated by the flavor header.
pub const METADATA_ROOT: &str = "/computeMetadata/v1";

const MISSING_FLAVOR_BODY: &str = "Missing required header \"Metadata-Flavor\": \"Google\"";

/// Boxed future returned by handlers and listers.
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;
/// Terminal endpoint producing a payload.
pub type HandlerFn = Arc<dyn Fn(RequestContext) -> BoxFuture<Result<Payload>> + Send + Sync>;
/// Materializes the live values of a parameterized child directory.
pub type ListerFn = Arc<dyn Fn(RequestContext) -> BoxFuture<Result<Vec<String>>> + Send + Sync>;

type RenderFuture<'a> = Pin<Box<dyn Future<Output = Result<Value>> + Send + 'a>>;

/// Wrap an async closure as a [`HandlerFn`].
pub fn handler<F, Fut>(f: F) -> HandlerFn
where
	F: Fn(RequestContext) -> Fut + Send + Sync + 'static,
	Fut: Future<Output = Result<Payload>> + Send + 'static,
{
	Arc::new(move |ctx| Box::pin(f(ctx)))
}

/// Wrap an async closure as a [`ListerFn`].
pub fn lister<F, Fut>(f: F) -> ListerFn
where
	F: Fn(RequestContext) -> Fut + Send + Sync + 'static,
	Fut: Future<Output = Result<Vec<String>>> + Send + 'static,
{
	Arc::new(move |ctx| Box::pin(f(ctx)))
}

/// Request-scoped data handed to handlers and listers.
#[derive(Clone, Debug)]
pub struct RequestContext {
	/// Transport-level peer address.
	pub peer: SocketAddr,
	/// Parameter segments matched so far, keyed by parameter name.
	pub params: HashMap<String, String>,
	/// Decoded query parameters.
	pub query: HashMap<String, String>,
}
impl RequestContext {
	/// Context for `peer` with no matched parameters.
	pub fn new(peer: SocketAddr) -> Self {
		Self { peer, params: HashMap::new(), query: HashMap::new() }
	}

	/// Matched value of one parameter segment.
	pub fn param(&self, name: &str) -> Option<&str> {
		self.params.get(name).map(String::as_str)
	}
}

/// Handler outcome; the runtime shape drives the wire encoding.
#[derive(Clone, Debug)]
pub enum Payload {
	/// Plain text, sent as-is.
	Text(String),
	/// Newline-terminated lines of text.
	List(Vec<String>),
	/// JSON document.
	Json(Value),
}

enum EdgeNode {
	Handler(Route),
	Directory(Directory),
}

struct Route {
	handler: HandlerFn,
	// Token endpoints never render during a recursive directory browse.
	token_endpoint: bool,
}

#[derive(Default)]
struct Directory {
	literals: BTreeMap<String, EdgeNode>,
	param: Option<ParamEdge>,
	lister: Option<ListerFn>,
}

struct ParamEdge {
	name: String,
	node: Box<EdgeNode>,
}

/// Tree-structured route table mirroring the native metadata directory.
///
/// Built once at startup and read-only afterwards; registration conflicts are
/// programming errors and panic.
#[derive(Default)]
pub struct Router {
	root: Directory,
}
impl Router {
	/// An empty router.
	pub fn new() -> Self {
		Self::default()
	}

	/// Register a handler at `path`.
	pub fn route(&mut self, path: &str, handler: HandlerFn) {
		self.register(path, handler, false);
	}

	/// Register a token-issuing handler at `path`; it is skipped by recursive
	/// directory rendering so a browse never issues credentials.
	pub fn route_token(&mut self, path: &str, handler: HandlerFn) {
		self.register(path, handler, true);
	}

	/// Attach the lister materializing the parameterized child of `path`.
	pub fn lister(&mut self, path: &str, lister: ListerFn) {
		let directory = Self::directory_at(&mut self.root, path);

		if directory.lister.is_some() {
			panic!("duplicate lister registered at {path:?}");
		}

		directory.lister = Some(lister);
	}

	fn register(&mut self, path: &str, handler: HandlerFn, token_endpoint: bool) {
		let segments: Vec<&str> = path.split('/').filter(|piece| !piece.is_empty()).collect();
		let Some((leaf, parents)) = segments.split_last() else {
			panic!("cannot register a handler at the root");
		};
		let mut directory = &mut self.root;

		for segment in parents {
			directory = Self::descend(directory, segment, path);
		}

		let node = EdgeNode::Handler(Route { handler, token_endpoint });

		if let Some(name) = leaf.strip_prefix('$') {
			Self::check_param_conflicts(directory, name, path);

			if directory.lister.is_none() {
				panic!("parameter segment ${name} at {path:?} requires a lister on its parent");
			}
			if directory.param.is_some() {
				panic!("duplicate handler registered at {path:?}");
			}

			directory.param = Some(ParamEdge { name: name.to_owned(), node: Box::new(node) });
		} else {
			if directory.param.is_some() {
				panic!("literal segment {leaf:?} conflicts with a parameter at {path:?}");
			}
			if directory.literals.contains_key(*leaf) {
				panic!("duplicate handler registered at {path:?}");
			}

			directory.literals.insert((*leaf).to_owned(), node);
		}
	}

	fn directory_at<'a>(mut directory: &'a mut Directory, path: &str) -> &'a mut Directory {
		for segment in path.split('/').filter(|piece| !piece.is_empty()) {
			directory = Self::descend(directory, segment, path);
		}

		directory
	}

	fn descend<'a>(
		directory: &'a mut Directory,
		segment: &str,
		path: &str,
	) -> &'a mut Directory {
		if let Some(name) = segment.strip_prefix('$') {
			Self::check_param_conflicts(directory, name, path);

			if directory.lister.is_none() {
				panic!("parameter segment ${name} at {path:?} requires a lister on its parent");
			}

			let edge = directory.param.get_or_insert_with(|| ParamEdge {
				name: name.to_owned(),
				node: Box::new(EdgeNode::Directory(Directory::default())),
			});

			match edge.node.as_mut() {
				EdgeNode::Directory(child) => child,
				EdgeNode::Handler(_) =>
					panic!("segment ${name} at {path:?} is already a handler"),
			}
		} else {
			if directory.param.is_some() {
				panic!("literal segment {segment:?} conflicts with a parameter at {path:?}");
			}

			let node = directory
				.literals
				.entry(segment.to_owned())
				.or_insert_with(|| EdgeNode::Directory(Directory::default()));

			match node {
				EdgeNode::Directory(child) => child,
				EdgeNode::Handler(_) =>
					panic!("segment {segment:?} at {path:?} is already a handler"),
			}
		}
	}

	fn check_param_conflicts(directory: &Directory, name: &str, path: &str) {
		if !directory.literals.is_empty() {
			panic!("parameter segment ${name} conflicts with literal children at {path:?}");
		}
		if let Some(edge) = &directory.param
			&& edge.name != name
		{
			panic!(
				"parameter segment ${name} conflicts with existing parameter ${} at {path:?}",
				edge.name
			);
		}
	}

	/// Dispatch one request and produce the full response.
	pub async fn dispatch(
		&self,
		method: &Method,
		uri: &Uri,
		headers: &HeaderMap,
		peer: SocketAddr,
	) -> Response<String> {
		let path = uri.path();

		if method != Method::GET {
			return plain(StatusCode::METHOD_NOT_ALLOWED, "Only GET is supported.\n");
		}
		if path.starts_with(METADATA_ROOT)
			&& headers.get(METADATA_FLAVOR).and_then(|value| value.to_str().ok())
				!= Some(METADATA_FLAVOR_VALUE)
		{
			return plain(StatusCode::FORBIDDEN, MISSING_FLAVOR_BODY);
		}

		let mut ctx = RequestContext::new(peer);

		ctx.query = parse_query(uri.query().unwrap_or_default());

		match self.walk(path, &mut ctx).await {
			Ok(Walked::Handler(route)) => match (route.handler)(ctx).await {
				Ok(payload) => encode(payload),
				Err(err) => error_response(&err),
			},
			Ok(Walked::Directory(directory)) => {
				if !path.ends_with('/') {
					return redirect(path);
				}

				let recursive =
					ctx.query.get("recursive").is_some_and(|value| value == "true");

				if recursive {
					match self.render_recursive(directory, ctx).await {
						Ok(value) => encode(Payload::Json(value)),
						Err(err) => error_response(&err),
					}
				} else {
					match list_directory(directory, ctx).await {
						Ok(lines) => encode(Payload::List(lines)),
						Err(err) => error_response(&err),
					}
				}
			},
			Err(err) => error_response(&err),
		}
	}

	async fn walk<'a>(
		&'a self,
		path: &str,
		ctx: &mut RequestContext,
	) -> Result<Walked<'a>> {
		let mut directory = &self.root;

		let segments: Vec<&str> =
			path.split('/').filter(|piece: &&str| !piece.is_empty()).collect();
		let mut segments = segments.into_iter().peekable();

		while let Some(segment) = segments.next() {
			let node = match directory.literals.get(segment) {
				Some(node) => node,
				None => {
					let (edge, lister) = match (&directory.param, &directory.lister) {
						(Some(edge), Some(lister)) => (edge, lister),
						_ => return Err(Error::NotFound(not_found(path))),
					};
					let live = lister(ctx.clone()).await?;

					if !live.iter().any(|value| value == segment) {
						return Err(Error::NotFound(not_found(path)));
					}

					ctx.params.insert(edge.name.clone(), segment.to_owned());

					&*edge.node
				},
			};

			match node {
				EdgeNode::Directory(child) => directory = child,
				EdgeNode::Handler(route) =>
					return if segments.peek().is_none() {
						Ok(Walked::Handler(route))
					} else {
						Err(Error::NotFound(not_found(path)))
					},
			}
		}

		Ok(Walked::Directory(directory))
	}

	fn render_recursive<'a>(
		&'a self,
		directory: &'a Directory,
		ctx: RequestContext,
	) -> RenderFuture<'a> {
		Box::pin(async move {
			let mut object = Map::new();

			for (name, node) in &directory.literals {
				if let Some(value) = self.render_node(node, ctx.clone()).await? {
					object.insert(camel_from_kebab(name), value);
				}
			}
			if let (Some(edge), Some(lister)) = (&directory.param, &directory.lister) {
				for entry in lister(ctx.clone()).await? {
					let mut child_ctx = ctx.clone();

					child_ctx.params.insert(edge.name.clone(), entry.clone());

					if let Some(value) = self.render_node(&edge.node, child_ctx).await? {
						object.insert(entry, value);
					}
				}
			}

			Ok(Value::Object(object))
		})
	}

	async fn render_node(
		&self,
		node: &EdgeNode,
		ctx: RequestContext,
	) -> Result<Option<Value>> {
		match node {
			EdgeNode::Handler(route) => {
				if route.token_endpoint {
					return Ok(None);
				}

				let value = match (route.handler)(ctx).await? {
					Payload::Text(text) => Value::String(text),
					Payload::List(lines) =>
						Value::Array(lines.into_iter().map(Value::String).collect()),
					Payload::Json(value) => value,
				};

				Ok(Some(value))
			},
			EdgeNode::Directory(child) => Ok(Some(self.render_recursive(child, ctx).await?)),
		}
	}
}

enum Walked<'a> {
	Handler(&'a Route),
	Directory(&'a Directory),
}

async fn list_directory(directory: &Directory, ctx: RequestContext) -> Result<Vec<String>> {
	let mut lines = Vec::new();

	for (name, node) in &directory.literals {
		match node {
			EdgeNode::Directory(_) => lines.push(format!("{name}/")),
			EdgeNode::Handler(_) => lines.push(name.clone()),
		}
	}
	if let (Some(edge), Some(lister)) = (&directory.param, &directory.lister) {
		let suffix = match edge.node.as_ref() {
			EdgeNode::Directory(_) => "/",
			EdgeNode::Handler(_) => "",
		};

		for entry in lister(ctx).await? {
			lines.push(format!("{entry}{suffix}"));
		}
	}

	Ok(lines)
}

/// Convert a kebab-case path segment into the camelCase key used by recursive
/// JSON rendering.
pub fn camel_from_kebab(name: &str) -> String {
	let mut out = String::with_capacity(name.len());
	let mut upper_next = false;

	for ch in name.chars() {
		if ch == '-' {
			upper_next = true;
		} else if upper_next {
			out.extend(ch.to_uppercase());
			upper_next = false;
		} else {
			out.push(ch);
		}
	}

	out
}

fn parse_query(query: &str) -> HashMap<String, String> {
	query
		.split('&')
		.filter(|piece| !piece.is_empty())
		.map(|piece| match piece.split_once('=') {
			Some((key, value)) => (key.to_owned(), value.to_owned()),
			None => (piece.to_owned(), String::new()),
		})
		.collect()
}

fn not_found(path: &str) -> String {
	format!("{path} was not found on this server.")
}

fn plain(status: StatusCode, body: &str) -> Response<String> {
	let mut response = Response::new(body.to_owned());

	*response.status_mut() = status;
	response
		.headers_mut()
		.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));

	response
}

fn redirect(path: &str) -> Response<String> {
	let mut response = Response::new(String::new());

	*response.status_mut() = StatusCode::MOVED_PERMANENTLY;

	if let Ok(location) = format!("{path}/").parse() {
		response.headers_mut().insert(header::LOCATION, location);
	}

	response
}

fn encode(payload: Payload) -> Response<String> {
	let (body, content_type) = match payload {
		Payload::Text(text) => (text, "text/plain; charset=utf-8"),
		Payload::List(lines) => {
			let mut body = String::new();

			for line in lines {
				body.push_str(&line);
				body.push('\n');
			}

			(body, "text/plain; charset=utf-8")
		},
		Payload::Json(value) => (value.to_string(), "application/json"),
	};
	let mut response = Response::new(body);
	let headers = response.headers_mut();

	headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
	headers.insert(METADATA_FLAVOR, HeaderValue::from_static(METADATA_FLAVOR_VALUE));
	headers.insert(header::SERVER, HeaderValue::from_static(SERVER_VALUE));

	response
}

fn error_response(err: &Error) -> Response<String> {
	let status = err.http_status();

	// Upstream bodies pass through verbatim so callers see exactly what the
	// cloud API said.
	if let Error::Upstream { body, .. } = unshare(err) {
		let mut response = Response::new(body.clone());

		*response.status_mut() = status;
		response
			.headers_mut()
			.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));

		return response;
	}

	plain(status, &format!("{err}\n"))
}

fn unshare(err: &Error) -> &Error {
	match err {
		Error::Shared(inner) => unshare(inner),
		other => other,
	}
}
