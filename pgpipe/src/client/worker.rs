//! Background task owning the connection.
//!
//! A [`Client`][super::Client] talks to its [`WorkerFuture`] over an unbounded
//! channel. The worker collects submissions, feeds backend messages to the
//! [`Pipeline`] and writes whatever the pipeline buffered.
use std::{
    io,
    pin::Pin,
    task::{Context, Poll, ready},
};
use tokio::{
    sync::{
        mpsc::{self, UnboundedReceiver, UnboundedSender},
        oneshot,
    },
    time::{Instant, Sleep, sleep_until},
};

use super::{
    Event,
    pipeline::{Pipeline, Submission},
};
use crate::{
    Connection, Error, Result,
    common::{debug, error, verbose},
    connection::{ConnectionState, is_disconnect},
    error::ConnectionClosed,
    net::Transport,
    postgres::frontend::Terminate,
};

pub(crate) enum WorkerMessage {
    Submit(Submission),
    Subscribe(UnboundedSender<Event>),
    End(oneshot::Sender<Result<()>>),
}

pub(crate) type EndReply = oneshot::Sender<Result<()>>;

enum State {
    Running,
    /// `Terminate` is buffered, flushing then shutting down.
    Terminating,
    Done,
}

/// Why the running phase stopped.
enum Stop {
    End,
    Fatal(Error),
}

pub(crate) struct WorkerFuture<T> {
    conn: Connection<T>,
    pipeline: Pipeline,
    recv: UnboundedReceiver<WorkerMessage>,
    sleep: Pin<Box<Sleep>>,
    state: State,
    ending: Vec<EndReply>,
}

impl<T: Transport> WorkerFuture<T> {
    pub(crate) fn new(conn: Connection<T>, pipeline: Pipeline) -> (UnboundedSender<WorkerMessage>, Self) {
        let (send, recv) = mpsc::unbounded_channel();
        (
            send,
            Self {
                conn,
                pipeline,
                recv,
                sleep: Box::pin(sleep_until(Instant::now())),
                state: State::Running,
                ending: Vec::new(),
            },
        )
    }

    fn poll_running(&mut self, cx: &mut Context) -> Poll<Stop> {
        loop {
            // NOTE:
            // 1. Collect all request upfront
            // 2. Resolve expired queries before anything is written
            // 3. Feed backend messages, which may unblock the queue
            // 4. Write whatever the pipeline buffered

            while let Poll::Ready(msg) = self.recv.poll_recv(cx) {
                let Some(msg) = msg else {
                    debug!("every client handle dropped, closing connection");
                    return Poll::Ready(Stop::End);
                };

                match msg {
                    WorkerMessage::Submit(submission) => self.pipeline.submit(submission),
                    WorkerMessage::Subscribe(events) => self.pipeline.subscribe(events),
                    WorkerMessage::End(reply) => {
                        self.ending.push(reply);
                        return Poll::Ready(Stop::End);
                    },
                }
            }

            let now = Instant::now();
            self.pipeline.expire(now);
            self.pipeline.dispatch(now);

            loop {
                let message = match self.conn.poll_message(cx) {
                    Poll::Ready(Ok(Some(message))) => message,
                    Poll::Ready(Ok(None)) => {
                        let eof = io::Error::new(io::ErrorKind::UnexpectedEof, "server closed the connection");
                        return Poll::Ready(Stop::Fatal(eof.into()));
                    },
                    Poll::Ready(Err(err)) => return Poll::Ready(Stop::Fatal(err)),
                    Poll::Pending => break,
                };

                if let Err(err) = self.pipeline.handle(message) {
                    return Poll::Ready(Stop::Fatal(err));
                }
                self.pipeline.dispatch(Instant::now());
            }

            let state = match self.pipeline.is_busy() {
                true => ConnectionState::Busy,
                false => ConnectionState::Idle,
            };
            if self.conn.state() != state {
                self.conn.set_state(state);
            }

            if let Some(out) = self.pipeline.take_output() {
                self.conn.send_raw(&out);
            }
            if self.conn.has_pending_write() {
                if let Poll::Ready(Err(err)) = self.conn.poll_flush(cx) {
                    return Poll::Ready(Stop::Fatal(err.into()));
                }
            }

            if let Some(deadline) = self.pipeline.next_deadline() {
                if self.sleep.deadline() != deadline {
                    verbose!("next query deadline in {:?}", deadline.saturating_duration_since(Instant::now()));
                    self.sleep.as_mut().reset(deadline);
                }
                if self.sleep.as_mut().poll(cx).is_ready() {
                    continue;
                }
            }

            return Poll::Pending;
        }
    }

    fn poll_terminate(&mut self, cx: &mut Context) -> Poll<io::Result<()>> {
        ready!(self.conn.poll_flush(cx))?;
        self.conn.poll_shutdown(cx)
    }

    /// Refuse anything still in the channel, the worker will not poll it again.
    fn reject_remaining(&mut self) {
        self.recv.close();
        while let Ok(msg) = self.recv.try_recv() {
            match msg {
                WorkerMessage::Submit(submission) => {
                    let _ = submission.reply.send(Err(ConnectionClosed::new(false, None).into()));
                },
                WorkerMessage::Subscribe(_) => {},
                WorkerMessage::End(reply) => self.ending.push(reply),
            }
        }
    }
}

impl<T: Transport> Future for WorkerFuture<T> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        let me = self.get_mut();

        loop {
            match me.state {
                State::Running => match ready!(me.poll_running(cx)) {
                    Stop::End => {
                        me.reject_remaining();
                        me.pipeline.close(None);
                        me.conn.set_state(ConnectionState::Ending);
                        me.conn.send(Terminate);
                        me.state = State::Terminating;
                    },
                    Stop::Fatal(err) => {
                        error!("connection failed: {err}");
                        me.reject_remaining();
                        me.pipeline.close(Some(err));
                        me.conn.set_state(ConnectionState::Ended);
                        for reply in me.ending.drain(..) {
                            let _ = reply.send(Ok(()));
                        }
                        me.state = State::Done;
                    },
                },
                State::Terminating => {
                    let result = match ready!(me.poll_terminate(cx)) {
                        Err(err) if is_disconnect(&err) => {
                            debug!("ignored error on terminate: {err}");
                            Ok(())
                        },
                        result => result,
                    };
                    me.conn.set_state(ConnectionState::Ended);

                    for reply in me.ending.drain(..) {
                        let result = match &result {
                            Ok(()) => Ok(()),
                            Err(err) => Err(io::Error::new(err.kind(), err.to_string()).into()),
                        };
                        let _ = reply.send(result);
                    }
                    me.state = State::Done;
                },
                State::Done => return Poll::Ready(()),
            }
        }
    }
}
