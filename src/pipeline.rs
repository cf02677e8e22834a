//! Ordered middleware chain around a terminal handler.
//!
//! Both agents run every frame through a pipeline built once at startup.
//! Middleware receives the context and a [`Next`] continuation; code before
//! `next.run(ctx)` runs in registration order, code after it unwinds in
//! reverse order. Middleware that returns without calling `next` skips the
//! rest of the chain and the handler.

use crate::error::StompError;

/// A middleware function.
pub type Middleware<C> = Box<dyn Fn(&mut C, Next<'_, C>) -> Result<(), StompError> + Send + Sync>;

/// The terminal handler of a pipeline.
pub type Handler<C> = Box<dyn Fn(&mut C) -> Result<(), StompError> + Send + Sync>;

/// Continuation passed to each middleware.
pub struct Next<'a, C> {
    rest: &'a [Middleware<C>],
    handler: Option<&'a Handler<C>>,
}

impl<'a, C> Next<'a, C> {
    /// Run the remaining middleware and then the handler.
    pub fn run(self, ctx: &mut C) -> Result<(), StompError> {
        match self.rest.split_first() {
            Some((middleware, rest)) => middleware(
                ctx,
                Next {
                    rest,
                    handler: self.handler,
                },
            ),
            None => match self.handler {
                Some(handler) => handler(ctx),
                None => Ok(()),
            },
        }
    }
}

pub struct Pipeline<C> {
    middlewares: Vec<Middleware<C>>,
    handler: Option<Handler<C>>,
}

impl<C> Default for Pipeline<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> Pipeline<C> {
    pub fn new() -> Self {
        Self {
            middlewares: Vec::new(),
            handler: None,
        }
    }

    /// Append a middleware (builder style).
    pub fn use_middleware<F>(mut self, middleware: F) -> Self
    where
        F: Fn(&mut C, Next<'_, C>) -> Result<(), StompError> + Send + Sync + 'static,
    {
        self.middlewares.push(Box::new(middleware));
        self
    }

    /// Set the terminal handler (builder style).
    pub fn run<F>(mut self, handler: F) -> Self
    where
        F: Fn(&mut C) -> Result<(), StompError> + Send + Sync + 'static,
    {
        self.handler = Some(Box::new(handler));
        self
    }

    pub fn len(&self) -> usize {
        self.middlewares.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }

    /// Execute the chain for one context.
    pub fn execute(&self, ctx: &mut C) -> Result<(), StompError> {
        Next {
            rest: &self.middlewares,
            handler: self.handler.as_ref(),
        }
        .run(ctx)
    }
}
