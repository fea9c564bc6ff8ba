/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The thread that delivers [events](crate::events) to their handlers.

use std::{
    sync::mpsc::{Receiver, TryRecvError},
    thread::{self, JoinHandle},
};

use crate::{events::*, logging::Logger};

pub(crate) type HandlerPtr<T> = Box<dyn Fn(&T) + Send>;

pub(crate) struct EventHandlers {
    pub(crate) propose_handlers: Vec<HandlerPtr<ProposeEvent>>,
    pub(crate) sign_handlers: Vec<HandlerPtr<SignEvent>>,
    pub(crate) commit_handlers: Vec<HandlerPtr<CommitEvent>>,
    pub(crate) send_view_change_handlers: Vec<HandlerPtr<SendViewChangeEvent>>,
    pub(crate) receive_prepare_handlers: Vec<HandlerPtr<ReceivePrepareEvent>>,
    pub(crate) receive_sign_handlers: Vec<HandlerPtr<ReceiveSignEvent>>,
    pub(crate) receive_commit_handlers: Vec<HandlerPtr<ReceiveCommitEvent>>,
    pub(crate) receive_view_change_handlers: Vec<HandlerPtr<ReceiveViewChangeEvent>>,
    pub(crate) start_view_handlers: Vec<HandlerPtr<StartViewEvent>>,
    pub(crate) view_timeout_handlers: Vec<HandlerPtr<ViewTimeoutEvent>>,
    pub(crate) finalize_block_handlers: Vec<HandlerPtr<FinalizeBlockEvent>>,
    pub(crate) request_missed_txs_handlers: Vec<HandlerPtr<RequestMissedTxsEvent>>,
}

/// Collect the user-defined `handler`, if any, and the default logger for `T` if `log_events` is set.
fn handlers_for<T: Logger>(log_events: bool, handler: Option<HandlerPtr<T>>) -> Vec<HandlerPtr<T>> {
    let mut handlers: Vec<HandlerPtr<T>> = Vec::new();
    if log_events {
        handlers.push(T::get_logger());
    }
    handlers.extend(handler);
    handlers
}

impl EventHandlers {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        log_events: bool,
        propose_handler: Option<HandlerPtr<ProposeEvent>>,
        sign_handler: Option<HandlerPtr<SignEvent>>,
        commit_handler: Option<HandlerPtr<CommitEvent>>,
        send_view_change_handler: Option<HandlerPtr<SendViewChangeEvent>>,
        receive_prepare_handler: Option<HandlerPtr<ReceivePrepareEvent>>,
        receive_sign_handler: Option<HandlerPtr<ReceiveSignEvent>>,
        receive_commit_handler: Option<HandlerPtr<ReceiveCommitEvent>>,
        receive_view_change_handler: Option<HandlerPtr<ReceiveViewChangeEvent>>,
        start_view_handler: Option<HandlerPtr<StartViewEvent>>,
        view_timeout_handler: Option<HandlerPtr<ViewTimeoutEvent>>,
        finalize_block_handler: Option<HandlerPtr<FinalizeBlockEvent>>,
        request_missed_txs_handler: Option<HandlerPtr<RequestMissedTxsEvent>>,
    ) -> EventHandlers {
        EventHandlers {
            propose_handlers: handlers_for(log_events, propose_handler),
            sign_handlers: handlers_for(log_events, sign_handler),
            commit_handlers: handlers_for(log_events, commit_handler),
            send_view_change_handlers: handlers_for(log_events, send_view_change_handler),
            receive_prepare_handlers: handlers_for(log_events, receive_prepare_handler),
            receive_sign_handlers: handlers_for(log_events, receive_sign_handler),
            receive_commit_handlers: handlers_for(log_events, receive_commit_handler),
            receive_view_change_handlers: handlers_for(log_events, receive_view_change_handler),
            start_view_handlers: handlers_for(log_events, start_view_handler),
            view_timeout_handlers: handlers_for(log_events, view_timeout_handler),
            finalize_block_handlers: handlers_for(log_events, finalize_block_handler),
            request_missed_txs_handlers: handlers_for(log_events, request_missed_txs_handler),
        }
    }

    /// Whether no handler at all is registered, in which case no event bus is started.
    pub(crate) fn is_empty(&self) -> bool {
        self.propose_handlers.is_empty()
            && self.sign_handlers.is_empty()
            && self.commit_handlers.is_empty()
            && self.send_view_change_handlers.is_empty()
            && self.receive_prepare_handlers.is_empty()
            && self.receive_sign_handlers.is_empty()
            && self.receive_commit_handlers.is_empty()
            && self.receive_view_change_handlers.is_empty()
            && self.start_view_handlers.is_empty()
            && self.view_timeout_handlers.is_empty()
            && self.finalize_block_handlers.is_empty()
            && self.request_missed_txs_handlers.is_empty()
    }

    pub(crate) fn fire_handlers(&self, event: Event) {
        match event {
            Event::Propose(propose_event) => self
                .propose_handlers
                .iter()
                .for_each(|handler| handler(&propose_event)),

            Event::Sign(sign_event) => self.sign_handlers.iter().for_each(|handler| handler(&sign_event)),

            Event::Commit(commit_event) => self
                .commit_handlers
                .iter()
                .for_each(|handler| handler(&commit_event)),

            Event::SendViewChange(send_view_change_event) => self
                .send_view_change_handlers
                .iter()
                .for_each(|handler| handler(&send_view_change_event)),

            Event::ReceivePrepare(receive_prepare_event) => self
                .receive_prepare_handlers
                .iter()
                .for_each(|handler| handler(&receive_prepare_event)),

            Event::ReceiveSign(receive_sign_event) => self
                .receive_sign_handlers
                .iter()
                .for_each(|handler| handler(&receive_sign_event)),

            Event::ReceiveCommit(receive_commit_event) => self
                .receive_commit_handlers
                .iter()
                .for_each(|handler| handler(&receive_commit_event)),

            Event::ReceiveViewChange(receive_view_change_event) => self
                .receive_view_change_handlers
                .iter()
                .for_each(|handler| handler(&receive_view_change_event)),

            Event::StartView(start_view_event) => self
                .start_view_handlers
                .iter()
                .for_each(|handler| handler(&start_view_event)),

            Event::ViewTimeout(view_timeout_event) => self
                .view_timeout_handlers
                .iter()
                .for_each(|handler| handler(&view_timeout_event)),

            Event::FinalizeBlock(finalize_block_event) => self
                .finalize_block_handlers
                .iter()
                .for_each(|handler| handler(&finalize_block_event)),

            Event::RequestMissedTxs(request_missed_txs_event) => self
                .request_missed_txs_handlers
                .iter()
                .for_each(|handler| handler(&request_missed_txs_event)),
        }
    }
}

pub(crate) fn start_event_bus(
    event_handlers: EventHandlers,
    event_subscriber: Receiver<Event>,
    shutdown_signal: Receiver<()>,
) -> JoinHandle<()> {
    thread::spawn(move || loop {
        match shutdown_signal.try_recv() {
            Ok(()) => return,
            Err(TryRecvError::Empty) => (),
            Err(TryRecvError::Disconnected) => {
                panic!("Event bus thread disconnected from main thread")
            }
        }

        match event_subscriber.try_recv() {
            Ok(event) => event_handlers.fire_handlers(event),
            Err(TryRecvError::Empty) => thread::yield_now(),
            // The consensus worker (the event publisher) has stopped.
            Err(TryRecvError::Disconnected) => return,
        }
    })
}
