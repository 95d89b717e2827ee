//! LIFO 栈单元测试
//!
//! 两种实现（无锁 / 加锁）共用同一组测试

use std::sync::Arc;

use crate::runtime::lifo::{AnyLifo, Lifo, LifoKind, NodeArena};
use crate::runtime::memory::AllocError;


const KINDS: [LifoKind; 2] = [LifoKind::Atomic, LifoKind::Locked];

fn stack<T>(
    kind: LifoKind,
    capacity: usize,
) -> (Arc<NodeArena<T>>, AnyLifo<T>) {
    let arena = Arc::new(NodeArena::with_capacity(capacity).unwrap());
    let stack = AnyLifo::new(kind, arena.clone()).unwrap();
    (arena, stack)
}

fn push_value<T: Send>(
    stack: &AnyLifo<T>,
    value: T,
) {
    let handle = stack.arena().alloc(value).unwrap();
    stack.push(handle);
}

fn pop_value<T: Send>(stack: &AnyLifo<T>) -> Option<T> {
    stack.pop().map(|handle| stack.arena().free(handle))
}

fn push_chain_of<T: Send>(
    stack: &AnyLifo<T>,
    values: impl IntoIterator<Item = T>,
) {
    let arena = stack.arena();
    let mut chain = arena.chain();
    chain.extend(values.into_iter().map(|v| arena.alloc(v).unwrap()));
    stack.push_chain(chain);
}

#[cfg(test)]
mod basic_tests {
    use super::*;

    #[test]
    fn test_push_then_pop_returns_same_value() {
        for kind in KINDS {
            let (arena, stack) = stack(kind, 4);
            assert!(stack.is_empty());

            let handle = arena.alloc(42u32).unwrap();
            let index = handle.index();
            stack.push(handle);
            assert!(!stack.is_empty());

            let popped = stack.pop().unwrap();
            assert_eq!(popped.index(), index);
            assert_eq!(*arena.get(&popped), 42);
            assert_eq!(arena.free(popped), 42);
            assert!(stack.pop().is_none());
        }
    }

    #[test]
    fn test_lifo_order() {
        for kind in KINDS {
            let (_arena, stack) = stack(kind, 8);
            for v in ["a", "b", "c"] {
                push_value(&stack, v);
            }
            assert_eq!(pop_value(&stack), Some("c"));
            assert_eq!(pop_value(&stack), Some("b"));
            assert_eq!(pop_value(&stack), Some("a"));
            assert_eq!(pop_value(&stack), None);
        }
    }

    #[test]
    fn test_chain_pops_in_append_order() {
        for kind in KINDS {
            let (_arena, stack) = stack(kind, 8);
            push_value(&stack, 0);
            push_chain_of(&stack, [1, 2, 3]);

            let drained: Vec<_> = std::iter::from_fn(|| pop_value(&stack)).collect();
            assert_eq!(drained, vec![1, 2, 3, 0]);
        }
    }

    #[test]
    fn test_single_node_chain_and_empty_chain() {
        for kind in KINDS {
            let (arena, stack) = stack(kind, 4);
            push_chain_of(&stack, Vec::<u8>::new());
            assert!(stack.is_empty());

            push_chain_of(&stack, [9u8]);
            assert_eq!(pop_value(&stack), Some(9));
            assert!(stack.is_empty());
            assert_eq!(arena.len(), 1);
        }
    }

    #[test]
    fn test_get_mut_through_handle() {
        let (arena, stack) = stack(LifoKind::Atomic, 4);
        push_value(&stack, vec![1, 2]);
        let mut handle = stack.pop().unwrap();
        arena.get_mut(&mut handle).push(3);
        assert_eq!(arena.free(handle), vec![1, 2, 3]);
    }

    #[test]
    fn test_pop_bumps_tag() {
        let (arena, stack) = stack::<u8>(LifoKind::Atomic, 4);
        let handle = arena.alloc(1).unwrap();
        let before = arena.node(&handle).tag();
        stack.push(handle);
        let handle = stack.pop().unwrap();
        assert_eq!(arena.node(&handle).tag(), before.wrapping_add(1));
        arena.free(handle);
    }

    #[test]
    fn test_kind_parse_and_display() {
        assert_eq!("lock-free".parse::<LifoKind>().unwrap(), LifoKind::Atomic);
        assert_eq!("Mutex".parse::<LifoKind>().unwrap(), LifoKind::Locked);
        assert!("spin".parse::<LifoKind>().is_err());
        assert_eq!(LifoKind::Locked.to_string(), "locked");

        let (_arena, stack) = stack::<u8>(LifoKind::Locked, 2);
        assert_eq!(stack.kind(), LifoKind::Locked);
    }
}

#[cfg(test)]
mod arena_tests {
    use super::*;

    #[test]
    fn test_arena_exhaustion() {
        for kind in KINDS {
            // One slot goes to the ghost.
            let (arena, stack) = stack(kind, 3);
            push_value(&stack, 1);
            push_value(&stack, 2);
            assert_eq!(arena.available(), 0);

            let err = arena.alloc(3).unwrap_err();
            assert_eq!(err, AllocError::ArenaExhausted { capacity: 3 });

            assert_eq!(pop_value(&stack), Some(2));
            assert!(arena.alloc(3).is_ok());
        }
    }

    #[test]
    fn test_no_room_for_ghost() {
        let arena = Arc::new(NodeArena::<u8>::with_capacity(0).unwrap());
        assert!(matches!(
            AnyLifo::new(LifoKind::Atomic, arena),
            Err(AllocError::ArenaExhausted { capacity: 0 })
        ));
    }

    #[test]
    fn test_ghost_reclaimed_on_drop() {
        for kind in KINDS {
            let (arena, stack) = stack::<u8>(kind, 2);
            assert_eq!(arena.len(), 1);
            drop(stack);
            assert_eq!(arena.len(), 0);
            assert_eq!(arena.available(), 2);
        }
    }

    #[test]
    fn test_drop_frees_queued_values() {
        for kind in KINDS {
            let token = Arc::new(());
            let (arena, stack) = stack(kind, 8);
            push_value(&stack, token.clone());
            push_chain_of(&stack, [token.clone(), token.clone()]);
            assert_eq!(Arc::strong_count(&token), 4);

            drop(stack);
            assert_eq!(Arc::strong_count(&token), 1);
            assert!(arena.is_empty());
        }
    }

    #[test]
    fn test_unpushed_chain_frees_its_nodes() {
        let arena = NodeArena::with_capacity(4).unwrap();
        {
            let mut chain = arena.chain();
            chain.append(arena.alloc('x').unwrap());
            chain.append(arena.alloc('y').unwrap());
            assert_eq!(chain.len(), 2);
            assert_eq!(arena.len(), 2);
        }
        assert_eq!(arena.len(), 0);
    }

    #[test]
    #[should_panic(expected = "did not allocate it")]
    fn test_foreign_handle_rejected() {
        let (_arena, stack) = stack::<u8>(LifoKind::Atomic, 2);
        let other = NodeArena::with_capacity(2).unwrap();
        stack.push(other.alloc(1).unwrap());
    }

    #[test]
    fn test_capacity_limit() {
        let err = NodeArena::<u8>::with_capacity(u32::MAX as usize).unwrap_err();
        assert!(matches!(err, AllocError::CapacityExceeded { .. }));
    }
}
