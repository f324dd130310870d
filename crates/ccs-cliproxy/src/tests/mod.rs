mod oauth_flow;
mod supervisor_lifecycle;
mod support;
