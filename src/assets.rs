//! Client-side code served or injected by the gateway.
//!
//! Everything here carries the no-rewrite marker so that the script rewriter
//! leaves it alone if a page ever fetches it back as a standalone asset.

use http::{HeaderValue, Response, StatusCode, header};
use hyper::Body;
use serde::Serialize;

use crate::routing::RoutingTarget;

pub const SERVICE_WORKER_PATH: &str = "/proxy-sw.js";

#[derive(Serialize)]
struct ClientConfig<'a> {
    #[serde(flatten)]
    target: &'a RoutingTarget,
    domain: &'a str,
}

/// The block prepended to `<head>`: the config object followed by the
/// location stand-in and the navigation hooks.
pub fn head_script(target: &RoutingTarget, domain: &str) -> String {
    let config = serde_json::to_string(&ClientConfig { target, domain })
        .unwrap_or_else(|_| "{}".to_string())
        // Hostnames cannot contain these, but the config lands inside a
        // <script> element.
        .replace('<', "\\u003c")
        .replace('>', "\\u003e");
    format!(
        "<script data-cmux-injected=\"true\">\n// __CMUX_NO_REWRITE__\nwindow.__CMUX_PROXY_CONFIG = {config};\n{LOCATION_SHIM}</script>"
    )
}

pub const SERVICE_WORKER_REGISTRATION: &str = r#"<script data-cmux-injected="true">
// __CMUX_NO_REWRITE__
if ('serviceWorker' in navigator) {
  navigator.serviceWorker.register('/proxy-sw.js', { scope: '/' }).catch(console.error);
}
</script>"#;

const LOCATION_SHIM: &str = r#"(function () {
  var config = window.__CMUX_PROXY_CONFIG || {};
  var realLocation = window.location;

  function isLoopbackHostname(hostname) {
    if (!hostname) {
      return false;
    }
    if (hostname === 'localhost' || hostname === '0.0.0.0') {
      return true;
    }
    if (hostname === '::1' || hostname === '[::1]' || hostname === '::' || hostname === '[::]') {
      return true;
    }
    return /^127(?:\.\d{1,3}){3}$/.test(hostname);
  }

  function hostForPort(port) {
    switch (config.scheme) {
      case 'legacy-port':
        return 'port-' + port + '-' + config.vmId + '.' + config.domain;
      case 'scoped':
        return 'cmux-' + config.vmId + '-' + config.scope + '-' + port + '.' + config.domain;
      case 'freestyle':
        return config.workspace + '-' + port + '-' + config.vmSlug + '.' + config.domain;
      default:
        return null;
    }
  }

  function rewriteUrl(value) {
    if (value === null || value === undefined) {
      return value;
    }
    var url;
    try {
      url = new URL(String(value), realLocation.href);
    } catch (err) {
      return value;
    }
    if (!isLoopbackHostname(url.hostname)) {
      return value;
    }
    var port = url.port || (url.protocol === 'https:' ? '443' : '80');
    var host = hostForPort(port);
    if (!host) {
      return value;
    }
    url.protocol = 'https:';
    url.hostname = host;
    url.port = '';
    return url.toString();
  }

  var proxyLocation = {
    assign: function (url) {
      realLocation.assign(rewriteUrl(url));
    },
    replace: function (url) {
      realLocation.replace(rewriteUrl(url));
    },
    reload: function () {
      realLocation.reload();
    },
    toString: function () {
      return realLocation.href;
    },
    valueOf: function () {
      return proxyLocation;
    }
  };

  ['origin', 'protocol', 'host', 'hostname', 'port', 'pathname', 'search', 'hash', 'username', 'password', 'ancestorOrigins'].forEach(function (name) {
    Object.defineProperty(proxyLocation, name, {
      enumerable: true,
      get: function () {
        return realLocation[name];
      },
      set: function (value) {
        realLocation[name] = value;
      }
    });
  });

  Object.defineProperty(proxyLocation, 'href', {
    enumerable: true,
    get: function () {
      return realLocation.href;
    },
    set: function (value) {
      realLocation.href = rewriteUrl(value);
    }
  });

  Object.defineProperty(proxyLocation, 'searchParams', {
    enumerable: true,
    get: function () {
      return new URL(realLocation.href).searchParams;
    }
  });

  Object.defineProperty(window, '__cmuxLocation', {
    configurable: true,
    get: function () {
      return proxyLocation;
    },
    set: function (value) {
      realLocation.href = rewriteUrl(value);
    }
  });

  var originalOpen = window.open;
  window.open = function (url) {
    var args = Array.prototype.slice.call(arguments);
    if (args.length > 0) {
      args[0] = rewriteUrl(url);
    }
    return originalOpen.apply(window, args);
  };

  document.addEventListener('click', function (event) {
    var node = event.target;
    while (node && node.nodeName !== 'A') {
      node = node.parentNode;
    }
    if (!node || !node.href) {
      return;
    }
    var rewritten = rewriteUrl(node.href);
    if (rewritten !== node.href) {
      node.href = rewritten;
    }
  }, true);

  document.addEventListener('submit', function (event) {
    var form = event.target;
    if (!form || !form.action) {
      return;
    }
    var rewritten = rewriteUrl(form.action);
    if (rewritten !== form.action) {
      form.action = rewritten;
    }
  }, true);

  ['pushState', 'replaceState'].forEach(function (name) {
    var original = history[name];
    if (typeof original !== 'function') {
      return;
    }
    history[name] = function (state, title, url) {
      var args = Array.prototype.slice.call(arguments);
      if (args.length > 2) {
        args[2] = rewriteUrl(url);
      }
      return original.apply(history, args);
    };
  });
})();
"#;

const SERVICE_WORKER_JS: &str = r#"// __CMUX_NO_REWRITE__
self.addEventListener('install', () => {
  self.skipWaiting();
});

self.addEventListener('activate', (event) => {
  event.waitUntil(self.clients.claim());
});

function isLoopbackHostname(hostname) {
  if (!hostname) {
    return false;
  }
  if (hostname === 'localhost' || hostname === '0.0.0.0') {
    return true;
  }
  if (hostname === '::1' || hostname === '[::1]' || hostname === '::' || hostname === '[::]') {
    return true;
  }
  return /^127(?:\.\d{1,3}){3}$/.test(hostname);
}

const HOP_HEADERS = ['host', 'x-forwarded-for', 'x-forwarded-host', 'x-forwarded-proto', 'x-real-ip', 'forwarded'];

self.addEventListener('fetch', (event) => {
  const url = new URL(event.request.url);
  if (!isLoopbackHostname(url.hostname) || !url.port) {
    return;
  }
  const currentHost = self.location.hostname;
  const firstDot = currentHost.indexOf('.');
  if (firstDot === -1) {
    return;
  }
  const morphIdMatch = currentHost.slice(0, firstDot).match(/^port-\d+-(.+)$/);
  const domain = currentHost.slice(firstDot + 1);
  if (!morphIdMatch || !domain) {
    return;
  }
  const redirectUrl = `https://port-${url.port}-${morphIdMatch[1]}.${domain}${url.pathname}${url.search}`;

  const headers = new Headers(event.request.headers);
  HOP_HEADERS.forEach((name) => headers.delete(name));

  const init = {
    method: event.request.method,
    headers,
    credentials: event.request.credentials,
    redirect: 'follow',
  };
  if (event.request.method !== 'GET' && event.request.method !== 'HEAD') {
    init.body = event.request.clone().body;
    init.duplex = 'half';
  }
  event.respondWith(fetch(redirectUrl, init));
});
"#;

pub fn service_worker_response() -> Response<Body> {
    let mut response = Response::new(Body::from(SERVICE_WORKER_JS));
    *response.status_mut() = StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/javascript"),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    response
}
